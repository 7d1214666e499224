//! # Sessions
//!
//! A session is the open command channel copy tasks are issued through.
//! Asynchronous errors nobody waited for are bound to the session of the
//! task that produced them and are reaped when the session closes.

use alloc::sync::{Arc, Weak};
use core::fmt;

use crate::task::TaskRegistry;
use crate::types::{Owner, SessionId};

/// Shared part of a session, kept alive by its in-flight tasks
pub struct SessionInner {
    owner: Owner,
    tasks: Weak<TaskRegistry>,
}

impl SessionInner {
    /// Session identifier (address of this record)
    #[inline]
    pub fn id(&self) -> SessionId {
        SessionId::from_ptr(self as *const Self)
    }

    /// Principal the session acts for
    #[inline]
    pub fn owner(&self) -> Owner {
        self.owner
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(tasks) = self.tasks.upgrade() {
            tasks.reap_session(self.id());
        }
    }
}

impl fmt::Debug for SessionInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionInner")
            .field("id", &self.id())
            .field("owner", &self.owner)
            .finish()
    }
}

/// Open command channel
///
/// Dropping the session closes it. Failure records of its tasks are
/// reaped once the last in-flight task has let go of it too.
#[derive(Debug)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn new(owner: Owner, tasks: &Arc<TaskRegistry>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                owner,
                tasks: Arc::downgrade(tasks),
            }),
        }
    }

    /// Session identifier
    #[inline]
    pub fn id(&self) -> SessionId {
        self.inner.id()
    }

    /// Principal the session acts for
    #[inline]
    pub fn owner(&self) -> Owner {
        self.inner.owner
    }

    /// Reference held by a task for as long as it is in flight
    pub(crate) fn share(&self) -> Arc<SessionInner> {
        Arc::clone(&self.inner)
    }
}
