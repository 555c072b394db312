fn main() {
    if let Err(err) = workbench_server::cli::run() {
        tracing::error!(error = %err, "workbench-server failed");
        std::process::exit(1);
    }
}
