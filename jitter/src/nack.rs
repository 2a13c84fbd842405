//
// Copyright 2024 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::collections::BTreeSet;

use ps_common::WrappingCounter;

use crate::packet::{expand_seqnum, FullSequenceNumber, TruncatedSequenceNumber};

/// What the feedback path should send upstream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NackList {
    pub seqnums: Vec<TruncatedSequenceNumber>,
    pub request_key_frame: bool,
}

/// Sequence numbers believed lost. They are stored expanded so that the set sorts correctly
/// across rollovers.
#[derive(Debug, Default)]
pub struct MissingSequenceNumbers {
    missing: BTreeSet<FullSequenceNumber>,
    max_seqnum: Option<FullSequenceNumber>,
    latest_received: Option<TruncatedSequenceNumber>,
}

impl MissingSequenceNumbers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets everything, including the latest received sequence number.
    pub fn reset(&mut self) {
        self.missing.clear();
        self.max_seqnum = None;
        self.latest_received = None;
    }

    /// Forgets the missing sequence numbers only.
    pub fn clear(&mut self) {
        self.missing.clear();
    }

    pub fn latest_received(&self) -> Option<TruncatedSequenceNumber> {
        self.latest_received
    }

    /// Only moves the latest received sequence number forward, without tracking gaps.
    pub fn remember_latest(&mut self, seqnum: TruncatedSequenceNumber) {
        let _ = expand_seqnum(seqnum, &mut self.max_seqnum);
        self.latest_received = Some(match self.latest_received {
            Some(latest) => latest.latest(seqnum),
            None => seqnum,
        });
    }

    /// Marks everything between the latest received sequence number and this one as missing, or
    /// if this one is older, marks it as no longer missing. Gaps are only tracked from
    /// `last_decoded` onwards since anything before it can't be used anymore.
    ///
    /// Returns true iff the sequence number is the newest received so far.
    pub fn remember_received(
        &mut self,
        seqnum: TruncatedSequenceNumber,
        last_decoded: Option<TruncatedSequenceNumber>,
    ) -> bool {
        let full_seqnum = expand_seqnum(seqnum, &mut self.max_seqnum);
        let Some(mut latest) = self.latest_received else {
            // This is the first seqnum, so there is nothing missing and it's the latest.
            self.latest_received = Some(seqnum);
            return true;
        };
        if let Some(last_decoded) = last_decoded {
            latest = latest.latest(last_decoded);
        }

        if seqnum.is_newer_than(latest) {
            let full_latest = self.expand(latest);
            self.missing.extend(full_latest.saturating_add(1)..full_seqnum);
            self.latest_received = Some(seqnum);
            true
        } else {
            self.missing.remove(&full_seqnum);
            self.latest_received = Some(latest);
            false
        }
    }

    /// Drops every missing sequence number up to and including the given one.
    pub fn drop_up_to(&mut self, seqnum: TruncatedSequenceNumber) {
        let full_seqnum = self.expand(seqnum);
        self.missing = self.missing.split_off(&full_seqnum.saturating_add(1));
    }

    #[cfg(test)]
    pub fn contains(&self, seqnum: TruncatedSequenceNumber) -> bool {
        self.missing.contains(&self.expand(seqnum))
    }

    pub fn oldest(&self) -> Option<TruncatedSequenceNumber> {
        self.missing
            .first()
            .map(|seqnum| *seqnum as TruncatedSequenceNumber)
    }

    /// How far the oldest missing sequence number trails the given one.
    pub fn age_of_oldest(&self, seqnum: TruncatedSequenceNumber) -> Option<u16> {
        self.oldest().map(|oldest| seqnum.wrapping_sub(oldest))
    }

    pub fn len(&self) -> usize {
        self.missing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.missing.is_empty()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = TruncatedSequenceNumber> + '_ {
        self.missing
            .iter()
            .map(|seqnum| *seqnum as TruncatedSequenceNumber)
    }

    fn expand(&self, seqnum: TruncatedSequenceNumber) -> FullSequenceNumber {
        let mut max_seqnum = self.max_seqnum;
        expand_seqnum(seqnum, &mut max_seqnum)
    }
}
