//! Minimal polling executor and transfer futures
//!
//! For firmware without an async runtime. [`block_on`] spins a future to
//! completion with a no-op waker; each poll of a [`TransferFuture`] runs a
//! dispatcher pass. Paced retries still need the platform to deliver
//! [`UsbHost::timer_tick`] while the future is outstanding.
//!
//! Completions reached through a future are still pushed to the host's
//! completion queue.

use core::future::Future;
use core::pin::{pin, Pin};
use core::task::{Context, Poll, Waker};

use crate::error::{Result, UsbError};
use crate::host::UsbHost;
use crate::otg::RegisterPort;
use crate::transfer::{PipeHandle, TransferHandle, TransferRequest, TransferState};

/// Poll a future to completion using a blocking spin loop
pub fn block_on<F: Future>(future: F) -> F::Output {
    let mut future = pin!(future);
    let mut cx = Context::from_waker(Waker::noop());

    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(output) => return output,
            Poll::Pending => core::hint::spin_loop(),
        }
    }
}

/// Poll a future once, returning Ready or Pending
pub fn poll_once<F: Future>(future: Pin<&mut F>) -> Poll<F::Output> {
    let mut cx = Context::from_waker(Waker::noop());
    future.poll(&mut cx)
}

/// A submitted transfer that resolves once the engine completes it
///
/// Resolves to the number of IN bytes copied into the caller's buffer (0 for
/// OUT and no-data transfers). Dropping it before completion aborts the
/// transfer.
pub struct TransferFuture<'h, 'b, P: RegisterPort> {
    host: &'h UsbHost<P>,
    handle: Option<TransferHandle>,
    buf: &'b mut [u8],
}

impl<'h, 'b, P: RegisterPort> TransferFuture<'h, 'b, P> {
    /// Handle of the underlying transfer, `None` once resolved
    pub fn handle(&self) -> Option<TransferHandle> {
        self.handle
    }

    fn resolve(&mut self, handle: TransferHandle, ok: bool) -> Result<usize> {
        self.handle = None;
        if ok {
            let copied = self.host.reclaim(handle, self.buf);
            if copied.is_err() {
                // Data that does not fit is dropped along with the slot
                let _ = self.host.discard(handle);
            }
            return copied;
        }
        let error = self.host.transfer_error(handle).ok().flatten();
        let _ = self.host.discard(handle);
        Err(error.unwrap_or(UsbError::TransactionError))
    }
}

impl<P: RegisterPort> Future for TransferFuture<'_, '_, P> {
    type Output = Result<usize>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(handle) = this.handle else {
            return Poll::Ready(Err(UsbError::InvalidState));
        };

        this.host.poll();
        match this.host.status(handle) {
            Ok(TransferState::Done(status)) => Poll::Ready(this.resolve(handle, status.is_success())),
            Ok(_) => {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Err(e) => {
                this.handle = None;
                Poll::Ready(Err(e))
            }
        }
    }
}

impl<P: RegisterPort> Drop for TransferFuture<'_, '_, P> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.host.abort(handle);
            let _ = self.host.discard(handle);
        }
    }
}

impl<P: RegisterPort> UsbHost<P> {
    /// Submit a transfer and return a future for its result
    ///
    /// IN data lands in `buf` when the future resolves.
    pub fn transfer<'h, 'b>(
        &'h self,
        pipe: PipeHandle,
        request: &TransferRequest<'_>,
        buf: &'b mut [u8],
    ) -> Result<TransferFuture<'h, 'b, P>> {
        let handle = self.submit(pipe, request)?;
        Ok(TransferFuture { host: self, handle: Some(handle), buf })
    }
}
