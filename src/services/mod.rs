pub mod controller;
pub mod device;
pub mod poller;
pub mod recorder;
pub mod uploader;

#[cfg(test)]
pub mod testing;

pub use controller::Controller;
pub use device::CaptureDevice;
pub use recorder::{Recorder, RecorderHandle};
