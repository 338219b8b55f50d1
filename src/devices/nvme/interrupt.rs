//! MSI-X delivery boundary, provided by the host VMM's PCI/interrupt
//! framework.

pub trait InterruptSink: Send + Sync {
    /// Fire the MSI-X vector associated with a completion queue.
    fn signal(&self, vector: u16);
}

/// No-op sink used where interrupt delivery is irrelevant to the test.
pub struct NullInterruptSink;

impl InterruptSink for NullInterruptSink {
    fn signal(&self, _vector: u16) {}
}

/// Records every fired vector, for assertions in tests.
#[derive(Default)]
pub struct RecordingInterruptSink {
    fired: parking_lot::Mutex<Vec<u16>>,
}

impl RecordingInterruptSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fired(&self) -> Vec<u16> {
        self.fired.lock().clone()
    }
}

impl InterruptSink for RecordingInterruptSink {
    fn signal(&self, vector: u16) {
        self.fired.lock().push(vector);
    }
}
