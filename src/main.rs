//! vlinkd entry point.

use std::process::ExitCode;

use vlinkd::app::Application;
use vlinkd::logger;

fn main() -> ExitCode {
    logger::init();

    let args: Vec<String> = std::env::args().collect();
    let mut app = Application::new(args);

    let outcome = app
        .init()
        .and_then(|did_work| if did_work { app.run() } else { Ok(()) });

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("An error occurred!\n\t{err}");
            ExitCode::from(err.code())
        }
    }
}
