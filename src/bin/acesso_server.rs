//! Ingestion server binary

#[tokio::main]
async fn main() {
    if let Err(e) = acesso_sync_lib::run_server().await {
        log::error!("Ingestion server failed: {}", e);
        eprintln!("FATAL: {}", e);
        std::process::exit(1);
    }
}
