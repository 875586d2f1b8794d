fn main() {
    if let Err(err) = parkwell::app::run() {
        eprintln!("application startup failed: {err}");
        std::process::exit(1);
    }
}
