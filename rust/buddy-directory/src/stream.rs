use crate::cache::PropertiesChanged;
use crate::handles::BuddyId;
use crate::protocol::ViewId;
use crate::registry::MembersChanged;
use futures_util::{ready, Stream};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

pin_project! {
    /// Membership events for a single view.
    ///
    /// Events missed because the receiver lagged are skipped; re-read
    /// `view_members` to resynchronize.
    pub struct ViewStream {
        #[pin]
        inner: BroadcastStream<MembersChanged>,
        view_id: ViewId,
    }
}

impl ViewStream {
    pub fn new(rx: broadcast::Receiver<MembersChanged>, view_id: ViewId) -> Self {
        Self {
            inner: BroadcastStream::new(rx),
            view_id,
        }
    }

    pub fn view_id(&self) -> ViewId {
        self.view_id
    }
}

impl Stream for ViewStream {
    type Item = MembersChanged;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            match ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(event)) if event.view_id == *this.view_id => {
                    return Poll::Ready(Some(event));
                }
                Some(Ok(_)) => continue,
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    tracing::warn!(view_id = *this.view_id, skipped, "view stream lagged");
                    continue;
                }
                None => return Poll::Ready(None),
            }
        }
    }
}

pin_project! {
    /// Property change events, optionally restricted to one buddy.
    pub struct PropertyStream {
        #[pin]
        inner: BroadcastStream<PropertiesChanged>,
        buddy: Option<BuddyId>,
    }
}

impl PropertyStream {
    pub fn new(rx: broadcast::Receiver<PropertiesChanged>, buddy: Option<BuddyId>) -> Self {
        Self {
            inner: BroadcastStream::new(rx),
            buddy,
        }
    }
}

impl Stream for PropertyStream {
    type Item = PropertiesChanged;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            match ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(event)) => {
                    if this.buddy.map_or(true, |b| b == event.buddy) {
                        return Poll::Ready(Some(event));
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    tracing::warn!(skipped, "property stream lagged");
                }
                None => return Poll::Ready(None),
            }
        }
    }
}
