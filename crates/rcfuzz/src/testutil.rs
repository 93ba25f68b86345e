//! Shared fakes for unit tests.

use std::sync::Mutex;

use crate::driver::{DriverRequest, FuzzerDriver};
use crate::error::Result;

/// Driver fake recording every dispatched command.
#[derive(Debug, Default)]
pub(crate) struct RecordingDriver {
    calls: Mutex<Vec<String>>,
}

impl RecordingDriver {
    fn log(&self, entry: String) -> Result<()> {
        self.calls.lock().unwrap().push(entry);
        Ok(())
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl FuzzerDriver for RecordingDriver {
    fn start(&self, request: &DriverRequest) -> Result<()> {
        self.log(format!("start {}", request.fuzzer))
    }

    fn stop(&self, request: &DriverRequest) -> Result<()> {
        self.log(format!("stop {}", request.fuzzer))
    }

    fn pause(&self, request: &DriverRequest) -> Result<()> {
        self.log(format!("pause {}", request.fuzzer))
    }

    fn resume(&self, request: &DriverRequest) -> Result<()> {
        self.log(format!("resume {}", request.fuzzer))
    }

    fn scale(&self, request: &DriverRequest, workers: u32) -> Result<()> {
        self.log(format!("scale {} {workers}", request.fuzzer))
    }
}
