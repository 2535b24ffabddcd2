// Good defaults
#![forbid(unused_must_use)]
#![deny(unsafe_code)]

#[tokio::main]
async fn main() {
    if let Err(e) = ostree_publish::cli::run_from_iter(std::env::args()).await {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}
