//! cosem-client: read one COSEM attribute from a meter

use clap::Parser;
use dlms::cli::{init_logging, run, Args};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args);

    match run(&args).await {
        Ok(value) => println!("{} {} attribute {}: {}", args.class_id, args.obis, args.attribute, value),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}
