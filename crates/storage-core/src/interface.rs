// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

//! Callbacks into whatever is presenting the installation to the user.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Informational, acknowledged with a single button.
    Ok,
    /// A question answered with yes or no.
    YesNo,
    /// A fatal condition. The installation stops once acknowledged.
    Error,
}

/// A long-running task whose completion is reported incrementally.
pub trait Progress {
    fn set(&mut self, completed: u64);
}

/// An open window, closed when dropped.
pub trait Window {}

pub trait Interface {
    /// Returns true for "yes" or acknowledgement.
    fn message_window(&self, title: &str, text: &str, kind: MessageKind) -> bool;

    fn progress_window(&self, title: &str, text: &str, total: u64) -> Box<dyn Progress + '_>;

    /// Shown while an operation of unknown length runs.
    fn wait_window(&self, title: &str, text: &str) -> Box<dyn Window + '_>;
}

/// Logs every message, answering questions with a fixed response.
#[derive(Clone, Copy, Debug)]
pub struct Headless {
    pub answer: bool,
}

impl Default for Headless {
    fn default() -> Self {
        Self { answer: true }
    }
}

struct LoggedProgress {
    title: String,
    total: u64,
}

impl Progress for LoggedProgress {
    fn set(&mut self, completed: u64) {
        tracing::debug!("{}: {}/{}", self.title, completed, self.total);
    }
}

struct LoggedWait {
    title: String,
}

impl Window for LoggedWait {}

impl Drop for LoggedWait {
    fn drop(&mut self) {
        tracing::debug!("{}: finished", self.title);
    }
}

impl Interface for Headless {
    fn message_window(&self, title: &str, text: &str, kind: MessageKind) -> bool {
        match kind {
            MessageKind::Error => tracing::error!("{}: {}", title, text),
            MessageKind::YesNo => tracing::warn!("{}: {} (answering {})", title, text, self.answer),
            MessageKind::Ok => tracing::info!("{}: {}", title, text),
        }

        kind != MessageKind::YesNo || self.answer
    }

    fn progress_window(&self, title: &str, text: &str, total: u64) -> Box<dyn Progress + '_> {
        tracing::info!("{}: {}", title, text);
        Box::new(LoggedProgress {
            title: title.to_owned(),
            total,
        })
    }

    fn wait_window(&self, title: &str, text: &str) -> Box<dyn Window + '_> {
        tracing::info!("{}: {}", title, text);
        Box::new(LoggedWait {
            title: title.to_owned(),
        })
    }
}
