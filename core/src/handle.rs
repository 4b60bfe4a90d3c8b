use std::cell::RefCell;
use std::rc::Rc;

use http::request::Parts;

/// Shared handle to the head of an in-flight request.
///
/// The host owns the request; a transform receives a clone of this handle
/// at the header event and may keep it while forwarding is suspended,
/// mutating through it when it finalizes. All access is scoped to a closure
/// via [`with`]/[`with_mut`], so no borrow outlives a single event
/// callback. Events for one request are delivered serially on one execution
/// context, which is why the handle is deliberately not `Send`.
///
/// Dropping a clone never frees the request head itself. A transform that
/// is torn down mid-request simply drops its clone; the host's copy stays
/// valid.
///
/// [`with`]: RequestHandle::with
/// [`with_mut`]: RequestHandle::with_mut
#[derive(Clone, Debug)]
pub struct RequestHandle {
    inner: Rc<RefCell<Parts>>,
}

impl RequestHandle {
    /// Wrap a request head into a shared handle.
    pub fn new(parts: Parts) -> Self {
        Self {
            inner: Rc::new(RefCell::new(parts)),
        }
    }

    /// Read from the request head.
    pub fn with<R>(&self, f: impl FnOnce(&Parts) -> R) -> R {
        f(&self.inner.borrow())
    }

    /// Mutate the request head.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Parts) -> R) -> R {
        f(&mut self.inner.borrow_mut())
    }

    /// Take the request head back out.
    ///
    /// Returns `None` while another clone of the handle is still alive.
    pub fn into_parts(self) -> Option<Parts> {
        Rc::try_unwrap(self.inner).ok().map(RefCell::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts() -> Parts {
        http::Request::builder()
            .method(http::Method::GET)
            .uri("/hello")
            .body(())
            .expect("request must be valid")
            .into_parts()
            .0
    }

    #[test]
    fn test_mutation_is_visible_through_clones() {
        let host = RequestHandle::new(parts());
        let held = host.clone();

        held.with_mut(|parts| parts.method = http::Method::POST);

        assert_eq!(host.with(|parts| parts.method.clone()), http::Method::POST);
    }

    #[test]
    fn test_into_parts_waits_for_last_clone() {
        let host = RequestHandle::new(parts());
        let held = host.clone();

        assert!(host.into_parts().is_none());
        assert!(held.into_parts().is_some());
    }
}
