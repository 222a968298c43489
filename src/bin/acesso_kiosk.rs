//! Kiosk sync daemon binary

#[tokio::main]
async fn main() {
    if let Err(e) = acesso_sync_lib::run_kiosk().await {
        log::error!("Kiosk failed: {}", e);
        eprintln!("FATAL: {}", e);
        std::process::exit(1);
    }
}
