//! RecipientChannelRegistry: exclusive (device, recipient) subscriptions.
//!
//! A feature subscribes to the messages a device sends to one *recipient
//! identifier*.  Identifiers are chosen by features and are not authenticated
//! here, so a second registration for an identifier already claimed on the
//! same device cannot be told apart from a hijack attempt.  The registry
//! treats it as one:
//!
//! ```text
//! register(D, R, cb)
//!   R deny-listed?           ──► cb gets InsecureRecipientDetected
//!   (D, R) already claimed?  ──► old + new get InsecureRecipientDetected,
//!                                old channel removed, R deny-listed forever
//!   otherwise                ──► channel created, missed messages for (D, R)
//!                                flushed to cb in arrival order
//! ```
//!
//! # Atomicity
//!
//! The "already claimed?" check and the insert happen under the same map
//! entry lock, so two racing registrations for one (device, recipient) can
//! never both succeed.  Inbound routing takes the same entry lock, which is
//! what guarantees a message is either delivered or buffered (never both)
//! and that buffered messages are queued on the subscriber's executor before
//! anything that arrives after registration.
//!
//! A collision deny-lists the identifier while its entry is still locked, and
//! the vacant path re-checks the deny-list under the entry lock.  Channels for
//! the identifier that other devices created in the meantime are closed and
//! their subscribers notified.
//!
//! Lock order is always channels → missed-message buffer.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use carlink_core::{
    ConnectedDevice, DeviceCallback, DeviceError, DeviceId, DeviceMessage, Executor,
    RecipientId, Subscription,
};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tracing::{debug, info, warn};

type ChannelKey = (DeviceId, RecipientId);

/// A live subscription plus the device record it was registered against.
#[derive(Clone)]
struct Channel {
    device: ConnectedDevice,
    subscription: Subscription<dyn DeviceCallback>,
}

/// Outcome of [`RecipientChannelRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// The channel was created.
    Registered,
    /// The identifier is deny-listed; the caller was notified.
    DenyListed,
    /// The identifier was already claimed on this device; both parties were
    /// notified and the identifier is now deny-listed.
    Collision,
}

/// Registry of recipient channels, the deny-list, and missed messages.
#[derive(Default)]
pub struct RecipientChannelRegistry {
    channels: DashMap<ChannelKey, Channel>,
    deny_list: DashSet<RecipientId>,
    missed_messages: DashMap<RecipientId, HashMap<DeviceId, VecDeque<DeviceMessage>>>,
}

impl RecipientChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `recipient_id` on `device` for `callback`.
    pub fn register(
        &self,
        device: &ConnectedDevice,
        recipient_id: RecipientId,
        callback: Arc<dyn DeviceCallback>,
        executor: Arc<dyn Executor>,
    ) -> RegistrationOutcome {
        let subscription = Subscription::new(callback, executor);
        let device_id = device.device_id();

        if self.deny_list.contains(&recipient_id) {
            return self.reject_deny_listed(&subscription, device);
        }

        let previous = match self.channels.entry((device_id.clone(), recipient_id)) {
            Entry::Occupied(existing) => {
                // Deny-list before the slot is vacated.
                self.deny_list.insert(recipient_id);
                existing.remove()
            }
            Entry::Vacant(slot) => {
                if self.deny_list.contains(&recipient_id) {
                    drop(slot);
                    return self.reject_deny_listed(&subscription, device);
                }
                let missed = self.take_missed(device_id, recipient_id);
                if !missed.is_empty() {
                    debug!(
                        "flushing {} missed message(s) for {recipient_id} on {device_id}",
                        missed.len()
                    );
                }
                for message in missed {
                    let device = device.clone();
                    subscription.dispatch(move |cb| cb.on_message_received(&device, &message));
                }
                slot.insert(Channel {
                    device: device.clone(),
                    subscription,
                });
                info!("recipient {recipient_id} registered on {device_id}");
                return RegistrationOutcome::Registered;
            }
        };

        warn!(
            "recipient {recipient_id} registered twice on {device_id}; \
             identifier deny-listed and both subscribers notified"
        );
        notify_insecure(&previous.subscription, device);
        notify_insecure(&subscription, device);
        self.purge_recipient(recipient_id);
        RegistrationOutcome::Collision
    }

    /// Removes the channel for (`device_id`, `recipient_id`) only if it is
    /// held by `callback`.  Returns `true` if a channel was removed.
    pub fn unregister(
        &self,
        device_id: &DeviceId,
        recipient_id: RecipientId,
        callback: &Arc<dyn DeviceCallback>,
    ) -> bool {
        let removed = self
            .channels
            .remove_if(&(device_id.clone(), recipient_id), |_, channel| channel.subscription.is_for(callback))
            .is_some();
        if removed {
            debug!("recipient {recipient_id} unregistered on {device_id}");
        } else {
            debug!("ignoring unregister for {recipient_id} on {device_id}: not the current holder");
        }
        removed
    }

    /// Delivers `message` to its channel on `device`, or buffers it until the
    /// channel is registered.
    ///
    /// The buffer has no size limit and lives as long as the registry.
    /// Messages for identifiers that never register, or that are deny-listed,
    /// stay buffered for good.
    pub fn deliver_or_buffer(&self, device: &ConnectedDevice, message: DeviceMessage) {
        let device_id = device.device_id();
        let recipient_id = message.recipient_id();

        match self.channels.entry((device_id.clone(), recipient_id)) {
            Entry::Occupied(channel) => {
                let device = device.clone();
                channel
                    .get()
                    .subscription
                    .dispatch(move |cb| cb.on_message_received(&device, &message));
            }
            Entry::Vacant(_unclaimed) => {
                if self.deny_list.contains(&recipient_id) {
                    warn!(
                        "buffering message for deny-listed recipient {recipient_id} on {device_id}; \
                         it can never be delivered"
                    );
                } else {
                    debug!("no channel for {recipient_id} on {device_id}; buffering message");
                }
                self.missed_messages
                    .entry(recipient_id)
                    .or_default()
                    .entry(device_id.clone())
                    .or_default()
                    .push_back(message);
            }
        }
    }

    /// Runs `action` for every channel on `device_id`, whatever its recipient.
    pub fn notify_device<F>(&self, device_id: &DeviceId, action: F)
    where
        F: Fn(&dyn DeviceCallback) + Send + Sync + 'static,
    {
        let targets: Vec<Subscription<dyn DeviceCallback>> = self
            .channels
            .iter()
            .filter(|entry| &entry.key().0 == device_id)
            .map(|entry| entry.value().subscription.clone())
            .collect();

        let action = Arc::new(action);
        for subscription in targets {
            let action = Arc::clone(&action);
            subscription.dispatch(move |cb| action(cb));
        }
    }

    /// Drops every channel on `device_id`.  Returns how many were removed.
    pub fn remove_device(&self, device_id: &DeviceId) -> usize {
        let mut removed = 0;
        self.channels.retain(|(channel_device, _), _| {
            let keep = channel_device != device_id;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    pub fn is_deny_listed(&self, recipient_id: &RecipientId) -> bool {
        self.deny_list.contains(recipient_id)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Number of buffered messages waiting for (`device_id`, `recipient_id`).
    pub fn pending_message_count(&self, device_id: &DeviceId, recipient_id: RecipientId) -> usize {
        self.missed_messages
            .get(&recipient_id)
            .and_then(|by_device| by_device.get(device_id).map(VecDeque::len))
            .unwrap_or(0)
    }

    fn reject_deny_listed(
        &self,
        subscription: &Subscription<dyn DeviceCallback>,
        device: &ConnectedDevice,
    ) -> RegistrationOutcome {
        warn!(
            "registration for deny-listed recipient on {} rejected",
            device.device_id()
        );
        notify_insecure(subscription, device);
        RegistrationOutcome::DenyListed
    }

    /// Closes channels for a freshly deny-listed `recipient_id` that were
    /// created on other devices before the deny-list entry became visible.
    fn purge_recipient(&self, recipient_id: RecipientId) {
        let mut purged = Vec::new();
        self.channels.retain(|(_, channel_recipient), channel| {
            if *channel_recipient == recipient_id {
                purged.push(channel.clone());
                false
            } else {
                true
            }
        });
        for channel in purged {
            warn!(
                "closing channel for deny-listed recipient {recipient_id} on {}",
                channel.device.device_id()
            );
            notify_insecure(&channel.subscription, &channel.device);
        }
    }

    fn take_missed(&self, device_id: &DeviceId, recipient_id: RecipientId) -> VecDeque<DeviceMessage> {
        let Entry::Occupied(mut by_device) = self.missed_messages.entry(recipient_id) else {
            return VecDeque::new();
        };
        let drained = by_device.get_mut().remove(device_id).unwrap_or_default();
        if by_device.get().is_empty() {
            by_device.remove();
        }
        drained
    }
}

fn notify_insecure(subscription: &Subscription<dyn DeviceCallback>, device: &ConnectedDevice) {
    let device = device.clone();
    subscription
        .dispatch(move |cb| cb.on_device_error(&device, DeviceError::InsecureRecipientDetected));
}
