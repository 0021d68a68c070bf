// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

use std::collections::BTreeSet;

/// Hands out filesystem labels that are unique across the whole installation.
#[derive(Clone, Debug, Default)]
pub struct LabelFactory {
    reserved: BTreeSet<String>,
}

impl LabelFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a label found on a surviving filesystem as taken.
    pub fn reserve(&mut self, label: &str) {
        self.reserved.insert(label.to_owned());
    }

    pub fn reserve_all<I, S>(&mut self, labels: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for label in labels {
            self.reserve(label.as_ref());
        }
    }

    pub fn is_reserved(&self, label: &str) -> bool {
        self.reserved.contains(label)
    }

    /// Takes `label` as-is, failing if it is already in use.
    pub fn claim(&mut self, label: &str) -> bool {
        self.reserved.insert(label.to_owned())
    }

    /// Creates and reserves a label derived from `base`, at most `max_chars` long.
    ///
    /// A colliding label is truncated to make room for a numeric suffix, which is
    /// incremented until the result is free.
    pub fn create_label(&mut self, base: &str, max_chars: usize) -> String {
        let base: String = base.chars().take(max_chars).collect();

        if !base.is_empty() && !self.reserved.contains(&base) {
            self.reserved.insert(base.clone());
            return base;
        }

        let mut count: u32 = 1;
        loop {
            let suffix = count.to_string();
            let keep = max_chars.saturating_sub(suffix.len());
            let mut candidate: String = base.chars().take(keep).collect();
            candidate.push_str(&suffix);

            if !self.reserved.contains(&candidate) {
                self.reserved.insert(candidate.clone());
                return candidate;
            }

            count += 1;
        }
    }
}
