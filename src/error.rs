use std::io;
use std::io::ErrorKind::Other;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unable to establish a wakeup channel after {attempts} attempts")]
    WakeupChannel { attempts: u32 },
    #[error("the monitor is shutting down")]
    ShuttingDown,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        io::Error::new(Other, value)
    }
}
