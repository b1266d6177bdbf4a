use mihari_supervisor::{cli, clean_logger};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let res = cli::run().await;
    clean_logger();
    if let Err(err) = res {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
    // A pending stdin read would otherwise keep the runtime from shutting down
    std::process::exit(0);
}
