use std::process::ExitCode;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    match recent_plays::run().await {
        Ok(report) => {
            println!(
                "fetched {} plays: {} inserted, {} skipped, {} malformed, {} failed",
                report.fetched, report.inserted, report.skipped, report.malformed, report.failed
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("ingestion run failed: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
