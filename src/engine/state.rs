// Owned state of the reconciliation engine
// Pure data + merge rules, no I/O. The actor in engine/mod.rs is the only
// writer; everything here runs synchronously inside one queue step.

use log::{debug, info};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::error::{ChatError, ChatResult};
use crate::models::{AccountIdentifier, ConfirmedMessage, DisplayMessage, LocalId, PendingMessage, PendingStatus};

pub struct EngineState {
    account: AccountIdentifier,
    confirmed: Vec<ConfirmedMessage>,
    confirmed_ids: HashSet<String>,
    pending: HashMap<LocalId, PendingMessage>,
    // Confirmed ids that already absorbed a (now removed) pending entry
    claimed: HashSet<String>,
}

impl EngineState {
    pub fn new(account: AccountIdentifier) -> Self {
        EngineState {
            account,
            confirmed: Vec::new(),
            confirmed_ids: HashSet::new(),
            pending: HashMap::new(),
            claimed: HashSet::new(),
        }
    }

    pub fn account(&self) -> &AccountIdentifier {
        &self.account
    }

    /// Forget everything about the current conversation
    pub fn reset(&mut self) {
        if !self.pending.is_empty() {
            info!("Discarding {} pending messages", self.pending.len());
        }
        self.confirmed.clear();
        self.confirmed_ids.clear();
        self.pending.clear();
        self.claimed.clear();
    }

    /// Create a new optimistic entry in `Unpublished`.
    pub fn begin_send(&mut self, content: &str) -> ChatResult<PendingMessage> {
        if content.trim().is_empty() {
            return Err(ChatError::EmptyContent);
        }
        if let Some(in_flight) = self
            .pending
            .values()
            .find(|p| p.status == PendingStatus::Unpublished && p.content == content)
        {
            debug!("Ignoring repeated submission of in-flight message {}", in_flight.local_id);
            return Err(ChatError::DuplicateSend(in_flight.local_id.clone()));
        }

        let pending = PendingMessage::new(content, &self.account);
        self.pending.insert(pending.local_id.clone(), pending.clone());
        Ok(pending)
    }

    /// Move a failed entry back to `Unpublished` for another transport attempt
    pub fn begin_retry(&mut self, local_id: &str) -> ChatResult<PendingMessage> {
        match self.pending.get_mut(local_id) {
            Some(pending) if pending.status == PendingStatus::Failed => {
                pending.status = PendingStatus::Unpublished;
                pending.attempt += 1;
                pending.last_error = None;
                Ok(pending.clone())
            }
            _ => Err(ChatError::NotFound(local_id.to_string())),
        }
    }

    pub fn cancel(&mut self, local_id: &str) -> ChatResult<PendingMessage> {
        match self.pending.get(local_id) {
            Some(pending) if pending.status == PendingStatus::Failed => {}
            _ => return Err(ChatError::InvalidState(local_id.to_string())),
        }
        self.pending
            .remove(local_id)
            .ok_or_else(|| ChatError::InvalidState(local_id.to_string()))
    }

    /// Returns false if the result belongs to a superseded attempt
    pub fn mark_published(&mut self, local_id: &str, attempt: u32) -> bool {
        match self.current_attempt(local_id, attempt) {
            Some(pending) => {
                pending.status = PendingStatus::Published;
                true
            }
            None => false,
        }
    }

    pub fn mark_failed(&mut self, local_id: &str, attempt: u32, reason: &str) -> bool {
        match self.current_attempt(local_id, attempt) {
            Some(pending) => {
                pending.status = PendingStatus::Failed;
                pending.last_error = Some(reason.to_string());
                true
            }
            None => false,
        }
    }

    fn current_attempt(&mut self, local_id: &str, attempt: u32) -> Option<&mut PendingMessage> {
        self.pending
            .get_mut(local_id)
            .filter(|p| p.attempt == attempt && p.status == PendingStatus::Unpublished)
    }

    /// Drop a `Published` entry whose grace window ran out
    pub fn expire(&mut self, local_id: &str, attempt: u32) -> bool {
        let still_published = self
            .pending
            .get(local_id)
            .map(|p| p.attempt == attempt && p.status == PendingStatus::Published)
            .unwrap_or(false);
        if still_published {
            self.pending.remove(local_id);
        }
        still_published
    }

    /// Add confirmed messages, ignoring ids we already have. Returns how many were new.
    pub fn merge_confirmed<I>(&mut self, messages: I) -> usize
    where
        I: IntoIterator<Item = ConfirmedMessage>,
    {
        let mut added = 0;
        for message in messages {
            if self.confirmed_ids.insert(message.id.clone()) {
                self.confirmed.push(message);
                added += 1;
            }
        }
        if added > 0 {
            self.confirmed.sort_by(compare_confirmed);
        }
        added
    }

    /// Remove `Published` entries that now have a confirmed counterpart.
    ///
    /// An `Unpublished` entry still has a transport call outstanding and is
    /// only hidden. Returns `(local_id, confirmed_id)` for each removal.
    pub fn reconcile(&mut self) -> Vec<(LocalId, String)> {
        let matches = self.match_pending();
        let mut removed = Vec::new();
        for (local_id, confirmed_id) in matches {
            let settled = self
                .pending
                .get(&local_id)
                .map(|p| p.status == PendingStatus::Published)
                .unwrap_or(false);
            if settled {
                self.pending.remove(&local_id);
                self.claimed.insert(confirmed_id.clone());
                removed.push((local_id, confirmed_id));
            }
        }
        removed
    }

    /// One-to-one pairing of pending entries with the confirmed messages that represent them.
    /// Earlier pending entries pair with earlier confirmed messages. `Failed`
    /// entries never reached the network and are never paired.
    fn match_pending(&self) -> Vec<(LocalId, String)> {
        let mut pending: Vec<&PendingMessage> = self
            .pending
            .values()
            .filter(|p| p.status != PendingStatus::Failed)
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.local_id.cmp(&b.local_id)));

        let mut used: HashSet<&str> = self.claimed.iter().map(String::as_str).collect();
        let mut matches = Vec::new();
        for entry in pending {
            let found = self
                .confirmed
                .iter()
                .find(|c| !used.contains(c.id.as_str()) && entry.is_confirmed_by(c));
            if let Some(confirmed) = found {
                used.insert(confirmed.id.as_str());
                matches.push((entry.local_id.clone(), confirmed.id.clone()));
            }
        }
        matches
    }

    /// Merged, time ordered projection of confirmed and pending messages.
    ///
    /// Ties go to confirmed entries first, then to the lexically smaller id.
    pub fn view(&self) -> Vec<DisplayMessage> {
        let represented: HashSet<LocalId> = self.match_pending().into_iter().map(|(local_id, _)| local_id).collect();

        let mut merged: Vec<DisplayMessage> = self.confirmed.iter().map(DisplayMessage::from).collect();
        merged.extend(
            self.pending
                .values()
                .filter(|p| !represented.contains(&p.local_id))
                .map(DisplayMessage::from),
        );
        merged.sort_by(compare_display);
        merged
    }

    #[cfg(test)]
    pub fn pending(&self, local_id: &str) -> Option<&PendingMessage> {
        self.pending.get(local_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn confirmed_count(&self) -> usize {
        self.confirmed.len()
    }
}

fn compare_confirmed(a: &ConfirmedMessage, b: &ConfirmedMessage) -> Ordering {
    a.sent_at.cmp(&b.sent_at).then_with(|| a.id.cmp(&b.id))
}

fn compare_display(a: &DisplayMessage, b: &DisplayMessage) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.is_pending().cmp(&b.is_pending()))
        .then_with(|| a.id.cmp(&b.id))
}
