use fiber_photometry_importer::batch::{convert_batch, load_requests};
use fiber_photometry_importer::JsonContainerWriter;
use std::env;
use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // A YAML list of session requests
    let requests_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "data/requests.yaml".to_string());
    let requests = load_requests(&requests_path)?;
    println!("Converting {} session(s) from {}", requests.len(), requests_path);

    let report = convert_batch(&requests, &JsonContainerWriter { pretty: true })?;

    println!("\nConverted:");
    for path in &report.converted {
        println!("  {}", path.display());
    }
    if !report.failed.is_empty() {
        println!("\nFailed (see error files):");
        for path in &report.failed {
            println!("  {}", path.display());
        }
    }

    Ok(())
}
