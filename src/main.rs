fn main() {
    if let Err(err) = hirecall_lib::run() {
        eprintln!("hirecall: {err:#}");
        std::process::exit(1);
    }
}
