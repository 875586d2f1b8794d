fn main() {
    if let Err(err) = parkwell::app::run_ingest() {
        eprintln!("ingest startup failed: {err}");
        std::process::exit(1);
    }
}
