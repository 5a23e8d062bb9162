#[path = "experiments/demos.rs"]
mod demos;

fn main() {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("chain");
    let result = match command {
        "--help" | "-h" | "help" => {
            print_help();
            return;
        }
        "chain" => demos::chain(),
        "control" => demos::control(),
        "gating" => demos::gating(),
        "learning" => {
            let trials = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(200);
            demos::learning(trials)
        }
        "scheduling" => demos::scheduling(),
        "graph" => demos::graph(),
        other => {
            eprintln!("Unknown command: {other}");
            print_help();
            std::process::exit(2);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn print_help() {
    println!("neuromech (composable neural-mechanism models)");
    println!("usage:");
    println!("  cargo run -- chain");
    println!("  cargo run -- control");
    println!("  cargo run -- gating");
    println!("  cargo run -- learning [trials]");
    println!("  cargo run -- scheduling");
    println!("  cargo run -- graph");
    println!("  cargo run -- --help");
}
