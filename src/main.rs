use tapevm::{Runtime, VERSION};
use tapevm::runtime::RuntimeConfig;
use tapevm::utils::{generate_demo_tape, write_tape};
use tracing_subscriber::EnvFilter;
use std::path::Path;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("tapevm v{}", VERSION);

    // Create demo tape file
    let demo_path = Path::new("demo.tape");
    let demo_tape = match generate_demo_tape() {
        Ok(tape) => tape,
        Err(e) => {
            eprintln!("Failed to build demo tape: {}", e);
            return;
        }
    };
    match write_tape(&demo_tape, demo_path, true) {
        Ok(_) => println!("Created demo tape file: demo.tape"),
        Err(e) => {
            eprintln!("Failed to create demo tape file: {}", e);
            return;
        }
    }

    // Initialize the runtime with debug mode
    let runtime = match Runtime::with_config(RuntimeConfig::default().with_debug_mode(true)) {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to initialize the runtime: {}", e);
            return;
        }
    };

    // Execute the demo file
    println!("\nExecuting demo tape...");
    match runtime.execute_file(demo_path) {
        Ok(result) => match runtime.render(&result) {
            Ok(text) => println!("Execution completed with result: {}", text),
            Err(e) => eprintln!("Failed to render result: {}", e),
        },
        Err(e) => eprintln!("Execution failed: {}", e),
    }

    // A second process gets its own heap
    let process = runtime.vm().create_process();
    println!("\nCreated process {} with heap {}", process.id(), process.heap().id());

    println!("\nTriggering garbage collection...");
    match runtime.collect() {
        Ok(freed) => println!("GC completed, {} objects freed", freed),
        Err(e) => eprintln!("GC failed: {}", e),
    }
}
