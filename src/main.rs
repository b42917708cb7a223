fn main() {
    if let Err(err) = studyroom_lib::run() {
        eprintln!("studyroom: {err:#}");
        std::process::exit(1);
    }
}
