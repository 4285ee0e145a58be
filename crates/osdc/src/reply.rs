//! Reply demultiplexing: matches an incoming `OP_REPLY` to its request by
//! tid, delivers payload into the request's own pages with no extra copy,
//! and fires completion exactly once.

use std::sync::Arc;

use bytes::Bytes;

use crate::registry::Registry;
use crate::request::{Page, ReplyOutcome, Request};
use crate::wire::ReplyHeader;

/// Outcome of the payload pre-landing hook, called by the messenger before
/// it reads the reply body off the wire.
pub enum PrepareOutcome {
    /// No matching, live request: the messenger should discard the payload.
    Discard,
    /// Installed `req.pages` as the destination; the messenger may now
    /// stream the body directly into them.
    Install(Arc<Request>),
}

/// `prepare_payload(msg, want_pages)`: look up the request by tid and, if
/// it is still registered, wants at least `want_pages`, and has not already
/// had its reply slot claimed, install its page vector as the inbound
/// destination.
pub fn prepare_payload(registry: &Registry, tid: u64, want_pages: usize) -> PrepareOutcome {
    let Some(req) = registry.lookup(tid) else {
        return PrepareOutcome::Discard;
    };
    if req.is_aborted() {
        return PrepareOutcome::Discard;
    }
    if req.reply_slot.lock().unwrap().is_some() {
        return PrepareOutcome::Discard;
    }
    let have_pages = req.pages.lock().unwrap().len();
    if have_pages < want_pages {
        return PrepareOutcome::Discard;
    }
    req.reply_pages.install(req.pages.clone());
    PrepareOutcome::Install(req)
}

/// `on_reply(msg)`: validate, match, unregister, and complete.
///
/// `front` is the reply's front bytes (header + one op result); `body` is
/// the optional bulk payload already landed into the request's pages by the
/// messenger via `prepare_payload`, or, for small/no-payload replies, the
/// inline bytes carried in the front section.
pub fn on_reply(registry: &Registry, front: &[u8]) -> Option<Arc<Request>> {
    let header = match ReplyHeader::decode(front) {
        Ok(h) => h,
        Err(e) => {
            tracing::warn!(?e, "dropping corrupt reply");
            return None;
        }
    };

    let req = registry.lookup(header.tid)?;

    {
        let mut slot = req.reply_slot.lock().unwrap();
        if slot.is_none() {
            *slot = Some(ReplyOutcome {
                result: header.result,
                op_result: header.op_result,
            });
        } else {
            tracing::warn!(tid = header.tid, "duplicate reply for request, ignoring");
        }
    }

    registry.unregister(header.tid);
    req.completion.fire(&req);
    Some(req)
}

/// Copy the bytes landed in `pages` into a flat buffer, up to `max_len`.
/// Used by the synchronous read path once a reply has completed.
pub fn collect_pages(pages: &[Page], max_len: usize) -> Bytes {
    let mut out = Vec::with_capacity(max_len.min(pages.iter().map(|p| p.len()).sum()));
    for page in pages {
        if out.len() >= max_len {
            break;
        }
        let take = (max_len - out.len()).min(page.len());
        out.extend_from_slice(&page[..take]);
    }
    Bytes::from(out)
}
