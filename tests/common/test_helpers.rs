use std::io;
use std::sync::{Arc, Mutex};
use tollgate::telemetry::{EventBus, MemorySink};
use tollgate::{Dispatcher, ManualClock, ManualClockSleeper, PolicyConfig};
use tracing_subscriber::fmt::MakeWriter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestError(pub &'static str);

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TestError: {}", self.0)
    }
}

impl std::error::Error for TestError {}

/// Dispatcher on a manual clock whose retry sleeps advance that clock.
pub struct Harness {
    pub dispatcher: Dispatcher<String, TestError>,
    pub clock: ManualClock,
    pub sink: MemorySink,
}

pub fn harness(config: PolicyConfig) -> Harness {
    harness_with(config, |builder| builder)
}

pub fn harness_with<F>(config: PolicyConfig, customize: F) -> Harness
where
    F: FnOnce(
        tollgate::DispatcherBuilder<String, TestError>,
    ) -> tollgate::DispatcherBuilder<String, TestError>,
{
    let clock = ManualClock::starting_at(1_000);
    let sink = MemorySink::new();
    let builder = Dispatcher::builder(config)
        .clock(Arc::new(clock.clone()))
        .sleeper(Arc::new(ManualClockSleeper::new(clock.clone())))
        .events(EventBus::new(sink.clone()));
    let dispatcher = customize(builder).build().expect("valid test config");
    Harness { dispatcher, clock, sink }
}

/// In-memory writer for asserting on formatted log output.
#[derive(Debug, Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        let bytes = self.0.lock().unwrap_or_else(|p| p.into_inner());
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Capture DEBUG and above on the current thread until the guard drops.
pub fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
    let buffer = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(buffer.clone())
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (buffer, guard)
}
