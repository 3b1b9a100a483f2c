use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use futures::channel::oneshot;
use log::{debug, error, warn};
use pin_project::pin_project;
use crate::backend::OpCtx;
use crate::context::{ContextInner, PollFd};
use crate::define::*;
use crate::error::*;
use crate::handle::HandleShared;
use crate::os::{IoCompletion, IoStatus, IoToken, OsHandle};

pub type ResultFuture<T> = Pin<Box<dyn Future<Output=T> + Send>>;

/// Terminal status of a transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Stall,
    TimedOut,
    Cancelled,
    Error,
    /// More data arrived than the transfer asked for.
    Overflow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTransfer {
    pub status: TransferStatus,
    pub actual_length: usize,
    /// Received bytes for IN transfers, empty otherwise.
    pub data: Vec<u8>,
}

impl CompletedTransfer {
    pub fn into_result(self) -> Result<Self> {
        match self.status {
            TransferStatus::Completed => Ok(self),
            TransferStatus::Stall => Err(Error::Pipe),
            TransferStatus::TimedOut => Err(Error::Timeout),
            TransferStatus::Cancelled => Err(Error::Cancelled),
            TransferStatus::Overflow => Err(Error::Overflow),
            TransferStatus::Error => Err(Error::Io("transfer failed".to_string())),
        }
    }
}

/// A transfer the caller wants submitted.
///
/// Endpoints are full addresses, bit 7 set for IN.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub(crate) kind: TransferKind,
    pub(crate) endpoint: u8,
    pub(crate) direction: Direction,
    pub(crate) setup: ControlSetup,
    pub(crate) data: Vec<u8>,
    pub(crate) length: usize,
    pub(crate) timeout: Duration,
    pub(crate) interface: Option<u8>,
    pub(crate) zero_packet: bool,
}

impl TransferRequest {
    fn new(kind: TransferKind, endpoint: u8, direction: Direction) -> Self {
        Self {
            kind,
            endpoint,
            direction,
            setup: ControlSetup::default(),
            data: vec![],
            length: 0,
            timeout: Duration::from_secs(0),
            interface: None,
            zero_packet: false,
        }
    }

    /// A control transfer from a raw setup packet. `data` is only sent for OUT requests.
    pub fn control(setup: ControlSetup, data: &[u8]) -> Self {
        let direction = setup.direction();
        let mut s = Self::new(TransferKind::Control, 0, direction);
        s.setup = setup;
        match direction {
            Direction::In => s.length = setup.length as usize,
            Direction::Out => {
                s.data = data.to_vec();
                s.length = data.len();
            }
        }
        s
    }

    pub fn control_in(request: ControlTransferRequest, capacity: u16) -> Self {
        let timeout = request.timeout;
        Self::control(request.setup(Direction::In, capacity), &[]).timeout(timeout)
    }

    pub fn control_out(request: ControlTransferRequest, data: &[u8]) -> Self {
        let timeout = request.timeout;
        let mut setup = request.setup(Direction::Out, 0);
        setup.length = data.len() as u16;
        Self::control(setup, data).timeout(timeout)
    }

    pub fn bulk_in(endpoint: u8, package_len: usize) -> Self {
        let mut s = Self::new(TransferKind::Bulk, endpoint, Direction::In);
        s.length = package_len;
        s
    }

    pub fn bulk_out(endpoint: u8, data: &[u8]) -> Self {
        let mut s = Self::new(TransferKind::Bulk, endpoint, Direction::Out);
        s.data = data.to_vec();
        s.length = data.len();
        s
    }

    pub fn interrupt_in(endpoint: u8, package_len: usize) -> Self {
        let mut s = Self::bulk_in(endpoint, package_len);
        s.kind = TransferKind::Interrupt;
        s
    }

    pub fn interrupt_out(endpoint: u8, data: &[u8]) -> Self {
        let mut s = Self::bulk_out(endpoint, data);
        s.kind = TransferKind::Interrupt;
        s
    }

    pub fn isochronous_in(endpoint: u8, package_len: usize) -> Self {
        let mut s = Self::bulk_in(endpoint, package_len);
        s.kind = TransferKind::Isochronous;
        s
    }

    /// Zero means no timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Interface that should carry a control transfer.
    pub fn interface(mut self, iface: u8) -> Self {
        self.interface = Some(iface);
        self
    }

    /// Terminate an OUT transfer with a zero length packet.
    pub fn zero_packet(mut self, zero_packet: bool) -> Self {
        self.zero_packet = zero_packet;
        self
    }

    pub(crate) fn validate(&self) -> Result {
        match self.kind {
            TransferKind::Control => {
                if self.length > u16::MAX as usize {
                    return Err(Error::InvalidParam);
                }
            }
            _ => {
                if self.endpoint & ENDPOINT_ADDRESS_MASK == 0
                    || Direction::of_endpoint(self.endpoint) != self.direction {
                    return Err(Error::InvalidParam);
                }
                if self.zero_packet && self.direction == Direction::Out {
                    return Err(Error::NotSupported);
                }
            }
        }
        Ok(())
    }
}

/// Backend visible bookkeeping of one transfer.
#[derive(Debug, Clone)]
pub(crate) struct TransferState {
    pub(crate) kind: TransferKind,
    pub(crate) endpoint: u8,
    pub(crate) direction: Direction,
    pub(crate) setup: ControlSetup,
    /// OUT payload before completion, received bytes after.
    pub(crate) buffer: Vec<u8>,
    pub(crate) length: usize,
    pub(crate) interface_hint: Option<usize>,
    /// Interface the backend bound the transfer to.
    pub(crate) interface: Option<usize>,
    pub(crate) auto_claimed: bool,
    /// Handle the I/O was issued on, used to cancel it.
    pub(crate) io_handle: Option<OsHandle>,
    /// Set when data goes through a HID report buffer.
    pub(crate) hid_report: bool,
    pub(crate) hid_expected: usize,
    pub(crate) actual_length: usize,
}

impl TransferState {
    pub(crate) fn new(request: TransferRequest) -> Self {
        Self {
            kind: request.kind,
            endpoint: request.endpoint,
            direction: request.direction,
            setup: request.setup,
            buffer: request.data,
            length: request.length,
            interface_hint: request.interface.map(|i| i as usize),
            interface: None,
            auto_claimed: false,
            io_handle: None,
            hid_report: false,
            hid_expected: 0,
            actual_length: 0,
        }
    }

    pub(crate) fn completed(&self, status: TransferStatus) -> CompletedTransfer {
        let data = match self.direction {
            Direction::In => {
                let n = self.actual_length.min(self.buffer.len());
                self.buffer[..n].to_vec()
            }
            Direction::Out => vec![],
        };
        CompletedTransfer { status, actual_length: self.actual_length, data }
    }
}

pub(crate) enum Pending {
    Token(IoToken),
    Ready(IoCompletion),
}

/// A submitted transfer waiting for the event loop.
pub(crate) struct InFlight {
    pub(crate) handle: Arc<HandleShared>,
    pub(crate) state: TransferState,
    pub(crate) pending: Pending,
    pub(crate) deadline: Option<Instant>,
    pub(crate) timed_out: bool,
    pub(crate) complete: oneshot::Sender<CompletedTransfer>,
}

impl InFlight {
    pub(crate) fn token(&self) -> Option<IoToken> {
        match self.pending {
            Pending::Token(t) => Some(t),
            Pending::Ready(_) => None,
        }
    }
}

/// Translate an OS completion into the final status, copying whatever data arrived.
pub(crate) fn finish_transfer(ctx: &mut OpCtx, t: &mut TransferState, completion: IoCompletion, timed_out: bool) -> TransferStatus {
    let ops = ctx.device.backend.ops();
    let status = match completion.status {
        IoStatus::Success => ops.copy_transfer_data(ctx, t, completion),
        IoStatus::GenFailure => {
            debug!("detected endpoint stall");
            TransferStatus::Stall
        }
        IoStatus::SemTimeout => {
            debug!("detected semaphore timeout");
            TransferStatus::TimedOut
        }
        IoStatus::OperationAborted => {
            let copied = ops.copy_transfer_data(ctx, t, completion);
            if copied != TransferStatus::Completed {
                debug!("failed to copy partial data in aborted operation: {:?}", copied);
            }
            if timed_out {
                debug!("detected timeout");
                TransferStatus::TimedOut
            } else {
                debug!("detected operation aborted");
                TransferStatus::Cancelled
            }
        }
        IoStatus::Failed(code) => {
            error!("detected I/O error {}", code);
            TransferStatus::Error
        }
    };
    if t.auto_claimed {
        if let Some(iface) = t.interface {
            if let Err(e) = ctx.auto_release(iface) {
                warn!("failed to auto-release interface {}: {}", iface, e);
            }
        }
        t.auto_claimed = false;
    }
    status
}

#[pin_project]
pub struct SubmitHandle {
    #[pin]
    future: ResultFuture<Result<CompletedTransfer>>,
    token: TransferCancelToken,
}

impl SubmitHandle {
    pub(crate) fn new(rx: oneshot::Receiver<CompletedTransfer>, token: TransferCancelToken) -> Self {
        Self {
            future: Box::pin(async move {
                rx.await.map_err(|_| Error::Other("transfer dropped before completion".to_string()))
            }),
            token,
        }
    }

    pub fn cancel_token(&self) -> TransferCancelToken {
        self.token.clone()
    }
}

impl Future for SubmitHandle {
    type Output = Result<CompletedTransfer>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        this.future.poll(cx)
    }
}

#[derive(Clone)]
pub struct TransferCancelToken {
    pub(crate) ctx: Weak<ContextInner>,
    pub(crate) fd: PollFd,
}

impl TransferCancelToken {
    /// Asynchronously cancel a previously submitted transfer.
    ///
    /// This function returns immediately, but this does not indicate cancellation is complete.
    /// The [SubmitHandle] still resolves once, with status [TransferStatus::Cancelled]
    /// (or [TransferStatus::Completed] if the transfer finished first).
    pub fn cancel(&self) -> Result {
        let ctx = self.ctx.upgrade().ok_or(Error::NoDevice)?;
        ctx.cancel_transfer(self.fd, false)
    }
}
