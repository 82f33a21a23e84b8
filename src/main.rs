mod cli;
mod command;
mod logger;
mod spinner;

use tracing::{error, info};
use vcoding::error::find_kind;

fn main() {
    if let Err(err) = logger::init() {
        eprintln!("warning: logging disabled: {err:#}");
    }
    info!(args = ?std::env::args().collect::<Vec<_>>(), "vcoding start");

    match cli::run() {
        Ok(()) => info!("vcoding finished successfully"),
        Err(err) => {
            error!(error = ?err, "vcoding failed");
            match find_kind(&err) {
                Some(kind) => eprintln!("error[{}]: {err:#}", kind.kind()),
                None => eprintln!("error: {err:#}"),
            }
            std::process::exit(1);
        }
    }
}
