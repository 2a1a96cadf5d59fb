//! Basic usage example for rexec
//!
//! This example demonstrates:
//! - Running commands as background tasks with streamed output
//! - Output timeouts
//! - Copying a directory tree between sessions
//! - Connecting to a remote host when `REXEC_TARGET` is set

use rexec::{CommandOptions, LocalSession, RexecError, Session, SessionRegistry, Task};
use std::error::Error;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing, configurable with RUST_LOG
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("rexec basic usage example");
    println!("=========================");

    let session = LocalSession::new();

    session.scope(|s| {
        // Two commands run concurrently, their lines arrive as they are printed
        println!("\nRunning two commands...");
        s.execute(
            "for i in 1 2 3; do echo \"slow $i\"; sleep 0.2; done",
            CommandOptions::new().on_stdout(|_, line| println!("   {}", line)),
        )?;
        s.execute(
            "echo fast; echo 'to stderr' >&2",
            CommandOptions::new()
                .on_stdout(|_, line| println!("   out: {}", line))
                .on_stderr(|_, line| println!("   err: {}", line)),
        )?;

        // A command that goes quiet for too long
        let quiet = s.execute(
            "echo started; sleep 5",
            CommandOptions::new()
                .with_output_timeout(Duration::from_millis(500))
                .with_kill_on_timeout(true)
                .on_timed_out(|task| println!("   {} went quiet", task.command())),
        )?;
        if let Err(e) = quiet.wait(true) {
            println!("Expected error: {}", e);
        }
        Ok::<_, RexecError>(())
    })?;
    println!("All commands done");

    // Copy a tree from one session to another
    println!("\nCopying a directory...");
    let workdir = std::env::temp_dir().join(format!("rexec-demo-{}", std::process::id()));
    std::fs::create_dir_all(workdir.join("src/nested"))?;
    std::fs::write(workdir.join("src/nested/hello.txt"), "Hello from rexec!\n")?;

    let target = LocalSession::new();
    session.copy_dir_to(&workdir.join("src"), &target, &workdir.join("copy"))?;
    println!(
        "Copied: {}",
        std::fs::read_to_string(workdir.join("copy/nested/hello.txt"))?.trim()
    );
    std::fs::remove_dir_all(&workdir)?;

    // Several sessions used as one unit
    let mut registry = SessionRegistry::new();
    registry.add("local", LocalSession::new());

    #[cfg(feature = "ssh2")]
    if let Ok(target) = std::env::var("REXEC_TARGET") {
        println!("\nConnecting to {}...", target);
        let config = rexec::SshConfig::from_target(&target);
        registry.add("remote", rexec::SshSession::connect(&config)?);
    }

    registry.scope(|registry| {
        for (name, session) in registry.iter() {
            let name = name.to_string();
            session.execute(
                "uname -a",
                CommandOptions::new().on_stdout(move |_, line| println!("   [{}] {}", name, line)),
            )?;
        }
        Ok::<_, RexecError>(())
    })?;

    println!("\nExample completed successfully!");
    Ok(())
}
