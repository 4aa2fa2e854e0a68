//! ## Session
//!
//! Runs a `;` separated command batch over one connection. Only the last step's reply is
//! reported, but every query is read back so the device stays in sync.
//!

use std::time::Duration;

use log::{debug, warn};

use crate::classify::{classify, Response};
use crate::communication::exchange;
use crate::communication::transport::Transport;
use crate::constants::misc::DEFAULT_DELAY;
use crate::error::Error;
use crate::types::BTag;

/// One entry of a command batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// `DLY<seconds>`, handled locally
    Delay(Duration),
    Command(String),
}

impl Step {
    fn parse(text: &str) -> Step {
        if let Some(seconds) = text.strip_prefix("DLY") {
            if seconds.is_empty() {
                return Step::Delay(DEFAULT_DELAY);
            }
            if seconds.bytes().all(|b| b.is_ascii_digit()) {
                // too many digits for a u64 still never reaches the device
                let seconds = seconds.parse::<u64>().unwrap_or(u64::MAX);
                return Step::Delay(Duration::from_secs(seconds));
            }
        }
        Step::Command(text.to_string())
    }
}

/// ### Parse Steps
///
/// Split a batch on `;`, trimming each step and dropping empty ones.
///
pub fn parse_steps(batch: &str) -> Vec<Step> {
    batch
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Step::parse)
        .collect()
}

/// ### Command Session
///
/// Owns the transport for the length of one batch and releases it when the batch ends,
/// successfully or not.
///
pub struct CommandSession<'a, T: Transport> {
    transport: T,
    btag: &'a mut BTag,
    sleep: Box<dyn FnMut(Duration) + 'a>,
}

impl<'a, T: Transport> CommandSession<'a, T> {
    pub fn new(transport: T, btag: &'a mut BTag) -> Self {
        Self {
            transport,
            btag,
            sleep: Box::new(std::thread::sleep),
        }
    }

    /// Replace how `DLY` steps wait.
    #[must_use]
    pub fn with_sleep(mut self, sleep: impl FnMut(Duration) + 'a) -> Self {
        self.sleep = Box::new(sleep);
        self
    }

    /// ### Run
    ///
    /// Execute every step in order and return the classified reply of the last one, or `None` when
    /// the last step is a delay or not a query. The first failure aborts the batch; after a
    /// transport failure the device is reset before the connection is released.
    ///
    pub fn run(mut self, batch: &str) -> Result<Option<Response>, Error> {
        let result = self.run_steps(batch);

        if let Err(err) = &result {
            if err.is_transport() {
                warn!("transfer failed ({err}), resetting device");
                if let Err(e) = self.transport.reset() {
                    warn!("device reset failed: {e}");
                }
            }
        }
        self.transport.release();

        result
    }

    fn run_steps(&mut self, batch: &str) -> Result<Option<Response>, Error> {
        let steps = parse_steps(batch);
        let mut last = None;

        for (n, step) in steps.iter().enumerate() {
            last = match step {
                Step::Delay(duration) => {
                    debug!("step {}: delay {:?}", n + 1, duration);
                    (self.sleep)(*duration);
                    None
                }
                Step::Command(command) => {
                    debug!("step {}: {}", n + 1, command);
                    self.execute(command)?
                }
            };

            if n + 1 < steps.len() {
                if let Some(response) = last.take() {
                    debug!("discarding reply of intermediate step: {response:?}");
                }
            }
        }

        Ok(last)
    }

    fn execute(&mut self, command: &str) -> Result<Option<Response>, Error> {
        exchange::send(&mut self.transport, self.btag, command)?;

        if !command.contains('?') {
            return Ok(None);
        }

        let reply = exchange::receive(&mut self.transport, self.btag)?;
        Ok(Some(classify(reply)))
    }
}
