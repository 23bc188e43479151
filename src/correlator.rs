//! Pairs each request with the response that follows it.
//!
//! The protocol carries no sequence numbers, so a [`Correlator`] never lets
//! more than one request reach the transport at a time. `request` takes
//! `&mut self`; callers that share one port across tasks go through
//! [`SharedBms`], which queues them in FIFO order.
//!
//! # Example
//!
//! ```no_run
//! use jbdbms_lib::protocol::Register;
//! use jbdbms_lib::tokio_serial_async::JbdBms;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), jbdbms_lib::Error> {
//!     let mut bms = JbdBms::open("/dev/ttyUSB0", 9600)?;
//!     bms.set_timeout(Duration::from_millis(500));
//!
//!     let status = bms.get_pack_status().await?;
//!     println!("SOC: {}%", status.soc_percent);
//!
//!     let cells = bms.request(Register::CellVoltages).await?;
//!     println!("Cells: {cells:?}");
//!     Ok(())
//! }
//! ```

use crate::framer::StreamFramer;
use crate::protocol::*;
use crate::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

type Result<T> = std::result::Result<T, Error>;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
const READ_CHUNK: usize = 64;

/// A duplex byte stream connected to one BMS.
pub trait BmsTransport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> BmsTransport for T {}

#[derive(Debug, Clone, PartialEq)]
pub enum CorrelatorState {
    Idle,
    Awaiting {
        register: Register,
        issued_at: Instant,
    },
    Faulted(String),
}

#[derive(Debug)]
pub struct Correlator<T> {
    transport: T,
    framer: StreamFramer,
    state: CorrelatorState,
    last_execution: Instant,
    io_timeout: Duration,
    delay: Duration,
}

impl<T: BmsTransport> Correlator<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            framer: StreamFramer::new(),
            state: CorrelatorState::Idle,
            last_execution: Instant::now(),
            io_timeout: DEFAULT_TIMEOUT,
            delay: MINIMUM_DELAY,
        }
    }

    pub fn state(&self) -> &CorrelatorState {
        &self.state
    }

    /// Sets how long a request may take from write until its response is
    /// framed.
    pub fn set_timeout(&mut self, timeout: Duration) {
        log::trace!("set timeout to {timeout:?}");
        self.io_timeout = timeout;
    }

    /// Sets the minimum delay between the end of one exchange and the next
    /// request. Values below [`MINIMUM_DELAY`] are raised to it.
    pub fn set_delay(&mut self, delay: Duration) {
        if delay < MINIMUM_DELAY {
            log::warn!("delay {delay:?} lower minimum {MINIMUM_DELAY:?}, use minimum");
            self.delay = MINIMUM_DELAY;
        } else {
            self.delay = delay;
        }
        log::trace!("set delay to {:?}", self.delay);
    }

    /// Acknowledges a fault. `request` does this implicitly.
    pub fn reset(&mut self) {
        if let CorrelatorState::Faulted(reason) = &self.state {
            log::debug!("fault acknowledged: {reason}");
        }
        self.state = CorrelatorState::Idle;
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Reads `register` and decodes the response.
    pub async fn request(&mut self, register: Register) -> Result<Telemetry> {
        let frame = self.exchange(register).await?;
        self.settle(register, Telemetry::decode(register, &frame))
    }

    /// Like [`Correlator::request`] for a raw register id. Unsupported ids
    /// are rejected before anything is written.
    pub async fn request_id(&mut self, register_id: u8) -> Result<Telemetry> {
        let register = Register::try_from(register_id)?;
        self.request(register).await
    }

    pub async fn get_pack_status(&mut self) -> Result<PackStatus> {
        log::trace!("get pack status");
        let frame = self.exchange(Register::PackStatus).await?;
        self.settle(Register::PackStatus, PackStatus::decode(&frame))
    }

    pub async fn get_cell_voltages(&mut self) -> Result<CellVoltages> {
        log::trace!("get cell voltages");
        let frame = self.exchange(Register::CellVoltages).await?;
        self.settle(Register::CellVoltages, CellVoltages::decode(&frame))
    }

    fn fault(&mut self, err: Error) -> Error {
        log::warn!("{err}");
        self.state = CorrelatorState::Faulted(err.to_string());
        err
    }

    fn settle<R>(&mut self, register: Register, decoded: Result<R>) -> Result<R> {
        match decoded {
            Ok(record) => {
                log::debug!("{register} answered");
                self.state = CorrelatorState::Idle;
                Ok(record)
            }
            Err(err) => Err(self.fault(err)),
        }
    }

    async fn await_delay(&self) {
        let last_exec_diff = Instant::now().duration_since(self.last_execution);
        if let Some(time_until_delay_reached) = self.delay.checked_sub(last_exec_diff) {
            tokio::time::sleep(time_until_delay_reached).await;
        }
    }

    /// Input that is already waiting while no request is outstanding cannot
    /// belong to the next request. Complete frames in it are dropped, a
    /// trailing partial frame stays in the framer.
    async fn discard_stale(&mut self, register: Register) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match tokio::time::timeout(Duration::ZERO, self.transport.read(&mut chunk)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(received)) => {
                    log::trace!("{received} pending bytes consumed");
                    self.framer.extend(&chunk[..received]);
                }
                Ok(Err(source)) => {
                    return Err(Error::TransportRead {
                        register: register.id(),
                        source,
                    })
                }
            }
        }
        let dropped = self.framer.discard_complete();
        if dropped > 0 {
            log::warn!("dropped {dropped} stale frame(s) before request");
        }
        Ok(())
    }

    /// Writes the request for `register` and returns the next frame.
    async fn exchange(&mut self, register: Register) -> Result<Vec<u8>> {
        self.reset();
        self.await_delay().await;
        if let Err(err) = self.discard_stale(register).await {
            return Err(self.fault(err));
        }

        let tx_buffer = register.request();
        let issued_at = Instant::now();
        self.state = CorrelatorState::Awaiting {
            register,
            issued_at,
        };
        log::debug!("request {register}");
        log::trace!("write bytes: {tx_buffer:02X?}");

        let written =
            tokio::time::timeout(self.io_timeout, self.transport.write_all(&tx_buffer)).await;
        let write_error = match written {
            Ok(Ok(())) => None,
            Ok(Err(source)) => Some(source),
            Err(_) => Some(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "write timed out",
            )),
        };
        if let Some(source) = write_error {
            return Err(self.fault(Error::TransportWrite {
                register: register.id(),
                source,
            }));
        }

        let remaining = self.io_timeout.saturating_sub(issued_at.elapsed());
        let received = tokio::time::timeout(remaining, self.read_frame()).await;
        self.last_execution = Instant::now();
        match received {
            Ok(Ok(frame)) => {
                log::trace!("receive frame: {frame:02X?}");
                Ok(frame)
            }
            Ok(Err(source)) => Err(self.fault(Error::TransportRead {
                register: register.id(),
                source,
            })),
            Err(_) => {
                if !self.framer.pending().is_empty() {
                    // the rest of this response may still arrive
                    self.framer.resync();
                }
                Err(self.fault(Error::Timeout {
                    register: register.id(),
                    elapsed: issued_at.elapsed(),
                }))
            }
        }
    }

    async fn read_frame(&mut self) -> std::io::Result<Vec<u8>> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.framer.next_frame() {
                return Ok(frame);
            }
            let received = self.transport.read(&mut chunk).await?;
            if received == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "transport closed",
                ));
            }
            log::trace!("read {received} bytes: {:02X?}", &chunk[..received]);
            self.framer.extend(&chunk[..received]);
        }
    }
}

/// A correlator shared between tasks.
///
/// Callers wait on a fair mutex, so requests reach the port one at a time in
/// the order they were made.
#[derive(Debug)]
pub struct SharedBms<T> {
    inner: Arc<tokio::sync::Mutex<Correlator<T>>>,
}

impl<T> Clone for SharedBms<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: BmsTransport> SharedBms<T> {
    pub fn new(correlator: Correlator<T>) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(correlator)),
        }
    }

    pub async fn request(&self, register: Register) -> Result<Telemetry> {
        self.inner.lock().await.request(register).await
    }

    pub async fn state(&self) -> CorrelatorState {
        self.inner.lock().await.state().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tests::{response_frame, EXAMPLE_PACK_STATUS};
    use tokio::io::DuplexStream;

    const CELLS: [u8; 4] = [0x0C, 0xE4, 0x0C, 0xE9];

    fn connect() -> (Correlator<DuplexStream>, DuplexStream) {
        let (client, device) = tokio::io::duplex(256);
        (Correlator::new(client), device)
    }

    async fn expect_request(device: &mut DuplexStream, register: Register) {
        let mut request = [0u8; REQUEST_LENGTH];
        device.read_exact(&mut request).await.unwrap();
        assert_eq!(request, register.request());
    }

    #[tokio::test(start_paused = true)]
    async fn decodes_pack_status_response() {
        let (mut bms, mut device) = connect();
        let fake = tokio::spawn(async move {
            expect_request(&mut device, Register::PackStatus).await;
            device.write_all(&EXAMPLE_PACK_STATUS).await.unwrap();
            device
        });

        let status = bms.get_pack_status().await.unwrap();
        assert_eq!(status.cell_count, 4);
        assert_eq!(status.soc_percent, 98);
        assert_eq!(bms.state(), &CorrelatorState::Idle);
        fake.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reassembles_response_split_in_chunks() {
        let (mut bms, mut device) = connect();
        let fake = tokio::spawn(async move {
            expect_request(&mut device, Register::PackStatus).await;
            for part in [
                &EXAMPLE_PACK_STATUS[..3],
                &EXAMPLE_PACK_STATUS[3..20],
                &EXAMPLE_PACK_STATUS[20..],
            ] {
                device.write_all(part).await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            device
        });

        let telemetry = bms.request(Register::PackStatus).await.unwrap();
        assert_eq!(telemetry.register(), Register::PackStatus);
        fake.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn checksum_failure_faults_until_next_request() {
        let (mut bms, mut device) = connect();
        let fake = tokio::spawn(async move {
            let mut corrupted = EXAMPLE_PACK_STATUS;
            corrupted[10] ^= 0x01;
            expect_request(&mut device, Register::PackStatus).await;
            device.write_all(&corrupted).await.unwrap();
            expect_request(&mut device, Register::CellVoltages).await;
            device
                .write_all(&response_frame(0x04, &CELLS))
                .await
                .unwrap();
            device
        });

        let err = bms.request(Register::PackStatus).await.unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { register: 0x03, .. }));
        assert!(matches!(bms.state(), CorrelatorState::Faulted(_)));

        let cells = bms.get_cell_voltages().await.unwrap();
        assert_eq!(cells.cells.len(), 2);
        assert_eq!(bms.state(), &CorrelatorState::Idle);
        fake.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn response_for_other_register_is_not_misattributed() {
        let (mut bms, mut device) = connect();
        let fake = tokio::spawn(async move {
            expect_request(&mut device, Register::PackStatus).await;
            device
                .write_all(&response_frame(0x04, &CELLS))
                .await
                .unwrap();
            device
        });

        let err = bms.get_pack_status().await.unwrap_err();
        match err {
            Error::MalformedFrame { register, frame, .. } => {
                assert_eq!(register, 0x03);
                assert_eq!(frame, response_frame(0x04, &CELLS));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(bms.state(), CorrelatorState::Faulted(_)));
        fake.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_times_out() {
        let (mut bms, mut device) = connect();
        bms.set_timeout(Duration::from_millis(200));
        let fake = tokio::spawn(async move {
            expect_request(&mut device, Register::CellVoltages).await;
            device
        });

        let err = bms.request(Register::CellVoltages).await.unwrap_err();
        match err {
            Error::Timeout { register, elapsed } => {
                assert_eq!(register, 0x04);
                assert!(elapsed >= Duration::from_millis(200));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(bms.state(), CorrelatorState::Faulted(_)));

        bms.reset();
        assert_eq!(bms.state(), &CorrelatorState::Idle);
        fake.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn late_frames_are_dropped_before_the_next_request() {
        let (mut bms, mut device) = connect();
        bms.set_timeout(Duration::from_millis(100));

        let first = bms.request(Register::CellVoltages);
        let fake = async {
            expect_request(&mut device, Register::CellVoltages).await;
            tokio::time::sleep(Duration::from_millis(150)).await;
        };
        let (result, ()) = tokio::join!(first, fake);
        assert!(matches!(result, Err(Error::Timeout { .. })));

        // the abandoned answer and a stray frame arrive while idle
        let mut late = response_frame(0x04, &[0x0B, 0xB8, 0x0B, 0xB8]);
        late.extend_from_slice(&EXAMPLE_PACK_STATUS);
        device.write_all(&late).await.unwrap();

        let second = bms.get_cell_voltages();
        let fake = async {
            expect_request(&mut device, Register::CellVoltages).await;
            device
                .write_all(&response_frame(0x04, &CELLS))
                .await
                .unwrap();
        };
        let (result, ()) = tokio::join!(second, fake);
        let cells = result.unwrap();
        assert_eq!(cells.cells[0].millivolts, 3300);
        assert_eq!(bms.state(), &CorrelatorState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn tail_of_abandoned_response_is_not_reused() {
        let (mut bms, mut device) = connect();
        bms.set_timeout(Duration::from_millis(100));
        let abandoned = response_frame(0x04, &[0x0B, 0xB8, 0x0B, 0xB8]);

        let first = bms.request(Register::CellVoltages);
        let fake = async {
            expect_request(&mut device, Register::CellVoltages).await;
            device.write_all(&abandoned[..6]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(150)).await;
        };
        let (result, ()) = tokio::join!(first, fake);
        assert!(matches!(
            result,
            Err(Error::Timeout { register: 0x04, .. })
        ));

        // the rest of the abandoned answer shows up after the next request
        let second = bms.get_cell_voltages();
        let fake = async {
            expect_request(&mut device, Register::CellVoltages).await;
            device.write_all(&abandoned[6..]).await.unwrap();
            device
                .write_all(&response_frame(0x04, &CELLS))
                .await
                .unwrap();
        };
        let (result, ()) = tokio::join!(second, fake);
        let cells = result.unwrap();
        assert_eq!(cells.cells[0].millivolts, 3300);
        assert_eq!(cells.cells[1].millivolts, 3305);
        assert_eq!(bms.state(), &CorrelatorState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_transport_is_reported() {
        let (mut bms, mut device) = connect();
        let fake = tokio::spawn(async move {
            expect_request(&mut device, Register::PackStatus).await;
            drop(device);
        });

        let err = bms.request(Register::PackStatus).await.unwrap_err();
        match err {
            Error::TransportRead { register, source } => {
                assert_eq!(register, 0x03);
                assert_eq!(source.kind(), std::io::ErrorKind::UnexpectedEof);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(bms.state(), CorrelatorState::Faulted(_)));
        fake.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_register_is_rejected_before_writing() {
        let (mut bms, mut device) = connect();
        let err = bms.request_id(0x05).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedRegister(0x05)));
        assert_eq!(bms.state(), &CorrelatorState::Idle);

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(50), device.read(&mut buf)).await;
        assert!(read.is_err(), "nothing may reach the transport");
    }

    #[tokio::test(start_paused = true)]
    async fn shared_requests_never_interleave() {
        let (bms, mut device) = connect();
        let shared = SharedBms::new(bms);

        let first = tokio::spawn({
            let shared = shared.clone();
            async move { shared.request(Register::PackStatus).await }
        });
        // let the first caller take the port
        tokio::time::sleep(Duration::from_millis(1)).await;
        let second = tokio::spawn({
            let shared = shared.clone();
            async move { shared.request(Register::CellVoltages).await }
        });

        expect_request(&mut device, Register::PackStatus).await;
        let mut buf = [0u8; 1];
        let early = tokio::time::timeout(Duration::from_millis(100), device.read(&mut buf)).await;
        assert!(early.is_err(), "second request written while first awaited");

        device.write_all(&EXAMPLE_PACK_STATUS).await.unwrap();
        expect_request(&mut device, Register::CellVoltages).await;
        device
            .write_all(&response_frame(0x04, &CELLS))
            .await
            .unwrap();

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first.register(), Register::PackStatus);
        assert_eq!(second.register(), Register::CellVoltages);
        assert_eq!(shared.state().await, CorrelatorState::Idle);
    }
}
