//! Per-consumer-context subscription table.
//!
//! A [`ConsumerDispatcher`] owns every [`Subscription`] created in one
//! consumer context, groups them into registrations by query fingerprint, and
//! invalidates them when a notification arrives, when their server fails, or
//! when they expire.
//!
//! Subscriber callbacks never run while the dispatcher's lock is held, so a
//! callback may call back into the dispatcher.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use query_notify_listener::{ConnectionParams, Notification, Principal};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::{debug, trace};

use crate::config::DispatcherConfig;
use crate::error::{Error, Result};
use crate::registry::{ProcessRegistry, StartOutcome};
use crate::routing::{CommandTarget, NotificationRequest, QueryFingerprint, RoutingKey};
use crate::subscription::Subscription;

#[derive(Debug)]
struct Registration {
   fingerprint: QueryFingerprint,
   members: Vec<String>,
}

/// Both directions of the fingerprint/registration mapping, updated together.
#[derive(Debug, Default)]
pub(crate) struct RegistrationIndex {
   by_fingerprint: HashMap<QueryFingerprint, String>,
   by_suffix: IndexMap<String, Registration>,
}

impl RegistrationIndex {
   /// Adds `subscription_id` to the registration for `fingerprint`, creating
   /// one if needed. Returns the routing key and whether it was created.
   pub(crate) fn attach(
      &mut self,
      context_id: &str,
      fingerprint: QueryFingerprint,
      subscription_id: &str,
   ) -> (RoutingKey, bool) {
      if let Some(suffix) = self.by_fingerprint.get(&fingerprint)
         && let Some(registration) = self.by_suffix.get_mut(suffix)
      {
         if !registration.members.iter().any(|m| m == subscription_id) {
            registration.members.push(subscription_id.to_string());
         }
         return (RoutingKey::new(context_id, suffix.clone()), false);
      }

      let key = RoutingKey::generate(context_id);
      self.by_fingerprint.insert(fingerprint, key.suffix().to_string());
      self.by_suffix.insert(
         key.suffix().to_string(),
         Registration {
            fingerprint,
            members: vec![subscription_id.to_string()],
         },
      );
      self.check_sync();
      (key, true)
   }

   /// Removes the registration for `suffix`, returning its members.
   pub(crate) fn take(&mut self, suffix: &str) -> Option<Vec<String>> {
      let registration = self.by_suffix.shift_remove(suffix)?;
      self.by_fingerprint.remove(&registration.fingerprint);
      self.check_sync();
      Some(registration.members)
   }

   /// Removes one member from the registration for `fingerprint`, dropping the
   /// registration when it becomes empty.
   pub(crate) fn detach(&mut self, fingerprint: &QueryFingerprint, subscription_id: &str) {
      let Some(suffix) = self.by_fingerprint.get(fingerprint).cloned() else {
         return;
      };
      let Some(registration) = self.by_suffix.get_mut(&suffix) else {
         return;
      };
      registration.members.retain(|m| m != subscription_id);
      if registration.members.is_empty() {
         self.by_suffix.shift_remove(&suffix);
         self.by_fingerprint.remove(fingerprint);
         trace!(suffix = %suffix, "Registration emptied");
      }
      self.check_sync();
   }

   pub(crate) fn len(&self) -> usize {
      self.by_suffix.len()
   }

   pub(crate) fn members(&self, suffix: &str) -> Option<&[String]> {
      self.by_suffix.get(suffix).map(|r| r.members.as_slice())
   }

   fn check_sync(&self) {
      debug_assert_eq!(self.by_fingerprint.len(), self.by_suffix.len());
   }
}

struct Entry {
   subscription: Arc<Subscription>,
   fingerprints: Vec<QueryFingerprint>,
}

#[derive(Default)]
struct Inner {
   subscriptions: IndexMap<String, Entry>,
   index: RegistrationIndex,
   next_expiration: Option<Instant>,
   sweep_task: Option<JoinHandle<()>>,
}

impl Inner {
   fn remove(&mut self, id: &str) -> Option<Arc<Subscription>> {
      let entry = self.subscriptions.shift_remove(id)?;
      for fingerprint in &entry.fingerprints {
         self.index.detach(fingerprint, id);
      }
      Some(entry.subscription)
   }

   fn stop_sweep_if_idle(&mut self) {
      if self.subscriptions.is_empty() {
         self.next_expiration = None;
         if let Some(task) = self.sweep_task.take() {
            task.abort();
            trace!("Sweep timer disabled");
         }
      }
   }
}

/// The subscription table of one consumer context.
pub struct ConsumerDispatcher {
   context_id: String,
   config: DispatcherConfig,
   registry: Weak<ProcessRegistry>,
   runtime: Handle,
   me: Weak<Self>,
   inner: Mutex<Inner>,
}

impl ConsumerDispatcher {
   /// Creates a dispatcher bound to the current tokio runtime.
   ///
   /// `registry` may be an empty `Weak` for a dispatcher that is only fed
   /// directly, in which case [`enlist`](Self::enlist), [`start`](Self::start)
   /// and [`stop`](Self::stop) fail with [`Error::RegistryUnavailable`].
   pub fn new(
      context_id: impl Into<String>,
      config: DispatcherConfig,
      registry: Weak<ProcessRegistry>,
   ) -> Result<Arc<Self>> {
      let runtime = Handle::try_current().map_err(|_| Error::RuntimeUnavailable)?;
      let context_id = context_id.into();
      debug!(context = %context_id, "Creating consumer dispatcher");
      Ok(Arc::new_cyclic(|me| Self {
         context_id,
         config,
         registry,
         runtime,
         me: me.clone(),
         inner: Mutex::new(Inner::default()),
      }))
   }

   pub fn context_id(&self) -> &str {
      &self.context_id
   }

   pub fn config(&self) -> &DispatcherConfig {
      &self.config
   }

   /// Creates and registers a subscription. `None` uses the configured
   /// default timeout.
   pub fn create_subscription(&self, timeout: Option<Duration>) -> Result<Arc<Subscription>> {
      let timeout = timeout
         .filter(|t| !t.is_zero())
         .unwrap_or_else(|| self.config.default_timeout());
      let subscription = Subscription::new(timeout);
      self.register(Arc::clone(&subscription))?;
      Ok(subscription)
   }

   /// Adds a subscription to the table and arms the sweep timer.
   pub fn register(&self, subscription: Arc<Subscription>) -> Result<()> {
      let mut inner = self.inner.lock();
      if inner.subscriptions.contains_key(subscription.id()) {
         return Err(Error::DuplicateRegistration(subscription.id().to_string()));
      }

      let expires_at = subscription.expires_at();
      inner.next_expiration = Some(match inner.next_expiration {
         Some(next) => next.min(expires_at),
         None => expires_at,
      });
      inner.subscriptions.insert(
         subscription.id().to_string(),
         Entry {
            subscription,
            fingerprints: Vec::new(),
         },
      );
      self.ensure_sweep(&mut inner);
      Ok(())
   }

   /// Removes a subscription without invalidating it.
   pub fn unregister(&self, subscription_id: &str) -> bool {
      let mut inner = self.inner.lock();
      let removed = inner.remove(subscription_id).is_some();
      inner.stop_sweep_if_idle();
      removed
   }

   /// Joins `subscription` to the registration for `fingerprint` and returns
   /// the routing key the command should carry.
   pub fn attach_to_query(
      &self,
      fingerprint: QueryFingerprint,
      subscription: &Subscription,
   ) -> Result<RoutingKey> {
      let mut inner = self.inner.lock();
      let Inner {
         subscriptions,
         index,
         ..
      } = &mut *inner;

      let entry = subscriptions
         .get_mut(subscription.id())
         .ok_or_else(|| Error::UnknownSubscription(subscription.id().to_string()))?;

      let (key, created) = index.attach(&self.context_id, fingerprint, subscription.id());
      if !entry.fingerprints.contains(&fingerprint) {
         entry.fingerprints.push(fingerprint);
      }
      if created {
         debug!(context = %self.context_id, key = %key, "Registration created");
      }
      Ok(key)
   }

   /// Prepares a command for notification: attaches the subscription to the
   /// command's registration, binds it to the listener's server, and returns
   /// the request to send with the command.
   ///
   /// A listener must already be started for the command's target.
   pub fn enlist(
      &self,
      subscription: &Subscription,
      target: &CommandTarget,
   ) -> Result<NotificationRequest> {
      let registry = self.registry.upgrade().ok_or(Error::RegistryUnavailable)?;
      let info = registry
         .server_info(&target.params, target.principal.clone(), target.queue.as_deref())
         .ok_or_else(|| Error::ListenerNotStarted {
            server: target.params.data_source().unwrap_or_default().to_string(),
            queue: target.queue.clone().unwrap_or_default(),
         })?;

      let key = self.attach_to_query(target.fingerprint(), subscription)?;
      subscription.bind_server(&info.server);

      let local_database = info.auto_provisioned.then_some(info.database.as_str());
      Ok(NotificationRequest::new(
         &key,
         &info.queue,
         local_database,
         subscription.timeout(),
      ))
   }

   /// Delivers a notification to the registration identified by `suffix`.
   ///
   /// Every member is removed from the table and invalidated. Unknown
   /// suffixes are ignored. Returns the number of subscriptions invalidated.
   pub fn on_message(&self, suffix: &str, notification: Notification) -> usize {
      let members = {
         let mut inner = self.inner.lock();
         let Some(ids) = inner.index.take(suffix) else {
            trace!(context = %self.context_id, suffix = %suffix, "No registration for message");
            return 0;
         };
         let members: Vec<_> = ids.iter().filter_map(|id| inner.remove(id)).collect();
         inner.stop_sweep_if_idle();
         members
      };

      invalidate_all(members, &notification)
   }

   /// Invalidates every subscription bound to `server`.
   pub fn invalidate_server(&self, server: &str, notification: Notification) -> usize {
      let bound = {
         let mut inner = self.inner.lock();
         let ids: Vec<String> = inner
            .subscriptions
            .iter()
            .filter(|(_, e)| e.subscription.is_bound_to(server))
            .map(|(id, _)| id.clone())
            .collect();
         let bound: Vec<_> = ids.iter().filter_map(|id| inner.remove(id)).collect();
         inner.stop_sweep_if_idle();
         bound
      };

      if !bound.is_empty() {
         debug!(
            context = %self.context_id,
            server = %server,
            count = bound.len(),
            "Invalidating subscriptions for server"
         );
      }
      invalidate_all(bound, &notification)
   }

   /// Invalidates every expired subscription.
   ///
   /// Returns immediately when the earliest known expiration is still in the
   /// future. Returns the number of subscriptions invalidated.
   pub fn sweep_now(&self) -> usize {
      let now = Instant::now();
      let expired = {
         let mut inner = self.inner.lock();
         match inner.next_expiration {
            Some(next) if next <= now => {}
            _ => return 0,
         }

         let ids: Vec<String> = inner
            .subscriptions
            .iter()
            .filter(|(_, e)| e.subscription.expires_at() <= now)
            .map(|(id, _)| id.clone())
            .collect();
         let expired: Vec<_> = ids.iter().filter_map(|id| inner.remove(id)).collect();

         inner.next_expiration = inner
            .subscriptions
            .values()
            .map(|e| e.subscription.expires_at())
            .min();
         inner.stop_sweep_if_idle();
         expired
      };

      if !expired.is_empty() {
         debug!(context = %self.context_id, count = expired.len(), "Sweeping expired subscriptions");
      }
      invalidate_all(expired, &Notification::timeout())
   }

   /// Starts (or joins) the listener for a target on behalf of this context.
   ///
   /// If the listener is in error state, subscriptions bound to its server
   /// are invalidated.
   pub async fn start(
      &self,
      params: &ConnectionParams,
      principal: Option<Principal>,
      queue: Option<&str>,
   ) -> Result<StartOutcome> {
      let registry = self.registry.upgrade().ok_or(Error::RegistryUnavailable)?;
      let outcome = registry.start(params, principal, queue, &self.context_id).await?;
      if outcome.error_state {
         self.invalidate_server(&outcome.server_info.server, Notification::server_failure());
      }
      Ok(outcome)
   }

   /// Releases one start made by this context. Returns true if the listener
   /// fully stopped. Errors that ended the listener's poll task are passed on.
   pub async fn stop(
      &self,
      params: &ConnectionParams,
      principal: Option<Principal>,
      queue: Option<&str>,
   ) -> Result<bool> {
      let registry = self.registry.upgrade().ok_or(Error::RegistryUnavailable)?;
      registry.stop(params, principal, queue, &self.context_id).await
   }

   pub fn subscription_count(&self) -> usize {
      self.inner.lock().subscriptions.len()
   }

   pub fn registration_count(&self) -> usize {
      self.inner.lock().index.len()
   }

   /// Ids of the subscriptions sharing the registration for `suffix`.
   pub fn registration_members(&self, suffix: &str) -> Vec<String> {
      self
         .inner
         .lock()
         .index
         .members(suffix)
         .map(<[String]>::to_vec)
         .unwrap_or_default()
   }

   pub fn is_sweep_armed(&self) -> bool {
      self.inner.lock().sweep_task.is_some()
   }

   /// Disarms the sweep timer. Subscriptions are left as they are.
   pub(crate) fn shutdown(&self) {
      if let Some(task) = self.inner.lock().sweep_task.take() {
         task.abort();
      }
   }

   fn ensure_sweep(&self, inner: &mut Inner) {
      if inner.sweep_task.is_some() {
         return;
      }

      let period = self.config.sweep_interval();
      let me = self.me.clone();
      inner.sweep_task = Some(self.runtime.spawn(async move {
         let mut ticker = interval_at(Instant::now() + period, period);
         loop {
            ticker.tick().await;
            let Some(dispatcher) = me.upgrade() else {
               break;
            };
            trace!(context = %dispatcher.context_id, "Sweep timer fired");
            dispatcher.sweep_now();
         }
      }));
      trace!(context = %self.context_id, "Sweep timer armed");
   }
}

impl Drop for ConsumerDispatcher {
   fn drop(&mut self) {
      if let Some(task) = self.inner.get_mut().sweep_task.take() {
         task.abort();
      }
   }
}

impl std::fmt::Debug for ConsumerDispatcher {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("ConsumerDispatcher")
         .field("context_id", &self.context_id)
         .field("subscriptions", &self.subscription_count())
         .field("registrations", &self.registration_count())
         .finish()
   }
}

fn invalidate_all(subscriptions: Vec<Arc<Subscription>>, notification: &Notification) -> usize {
   subscriptions
      .into_iter()
      .filter(|s| s.invalidate(notification.clone()))
      .count()
}

#[cfg(test)]
mod tests {
   use super::*;

   use query_notify_listener::{NotificationInfo, NotificationSource, NotificationType};

   fn dispatcher() -> Arc<ConsumerDispatcher> {
      ConsumerDispatcher::new("c1", DispatcherConfig::default(), Weak::new()).unwrap()
   }

   fn fingerprint(text: &str) -> QueryFingerprint {
      CommandTarget::new(ConnectionParams::parse("Data Source=db1"), text).fingerprint()
   }

   fn change() -> Notification {
      Notification::new(
         NotificationType::Change,
         NotificationSource::Data,
         NotificationInfo::Update,
         None,
      )
   }

   // ============================================================================
   // Registration Index
   // ============================================================================

   #[test]
   fn test_index_reuses_key_for_fingerprint() {
      let mut index = RegistrationIndex::default();
      let (a, created_a) = index.attach("c", fingerprint("q"), "s1");
      let (b, created_b) = index.attach("c", fingerprint("q"), "s2");
      assert!(created_a);
      assert!(!created_b);
      assert_eq!(a, b);
      assert_eq!(index.len(), 1);
      assert_eq!(index.members(a.suffix()).unwrap(), ["s1", "s2"]);
   }

   #[test]
   fn test_index_detach_drops_empty_registration() {
      let mut index = RegistrationIndex::default();
      let fp = fingerprint("q");
      index.attach("c", fp, "s1");
      index.attach("c", fp, "s2");

      index.detach(&fp, "s1");
      assert_eq!(index.len(), 1);
      index.detach(&fp, "s2");
      assert_eq!(index.len(), 0);
      assert!(index.by_fingerprint.is_empty());
   }

   #[test]
   fn test_index_take_removes_both_directions() {
      let mut index = RegistrationIndex::default();
      let (key, _) = index.attach("c", fingerprint("q"), "s1");
      assert_eq!(index.take(key.suffix()), Some(vec!["s1".to_string()]));
      assert_eq!(index.take(key.suffix()), None);
      assert!(index.by_fingerprint.is_empty());

      // A new attach for the same fingerprint gets a fresh key.
      let (again, created) = index.attach("c", fingerprint("q"), "s2");
      assert!(created);
      assert_ne!(again, key);
   }

   // ============================================================================
   // Dispatcher
   // ============================================================================

   #[tokio::test]
   async fn test_register_duplicate_fails() {
      let d = dispatcher();
      let sub = Subscription::new(Duration::from_secs(60));
      d.register(Arc::clone(&sub)).unwrap();
      let err = d.register(Arc::clone(&sub)).unwrap_err();
      assert!(matches!(err, Error::DuplicateRegistration(id) if id == sub.id()));
   }

   #[tokio::test]
   async fn test_attach_unknown_subscription_fails() {
      let d = dispatcher();
      let sub = Subscription::new(Duration::from_secs(60));
      let err = d.attach_to_query(fingerprint("q"), &sub).unwrap_err();
      assert!(matches!(err, Error::UnknownSubscription(_)));
   }

   #[tokio::test]
   async fn test_message_invalidates_all_members() {
      let d = dispatcher();
      let a = d.create_subscription(None).unwrap();
      let b = d.create_subscription(None).unwrap();
      let key = d.attach_to_query(fingerprint("q"), &a).unwrap();
      assert_eq!(d.attach_to_query(fingerprint("q"), &b).unwrap(), key);
      assert_eq!(d.registration_count(), 1);

      assert_eq!(d.on_message(key.suffix(), change()), 2);
      assert!(a.is_invalidated());
      assert!(b.is_invalidated());
      assert_eq!(d.registration_count(), 0);
      assert_eq!(d.subscription_count(), 0);

      // Redelivery is a no-op.
      assert_eq!(d.on_message(key.suffix(), change()), 0);
   }

   #[tokio::test]
   async fn test_message_removes_member_from_other_registrations() {
      let d = dispatcher();
      let sub = d.create_subscription(None).unwrap();
      let other = d.create_subscription(None).unwrap();
      let first = d.attach_to_query(fingerprint("q1"), &sub).unwrap();
      let second = d.attach_to_query(fingerprint("q2"), &sub).unwrap();
      d.attach_to_query(fingerprint("q2"), &other).unwrap();

      d.on_message(first.suffix(), change());
      assert_eq!(d.registration_members(second.suffix()), vec![other.id().to_string()]);
   }

   #[tokio::test]
   async fn test_unregister_does_not_invalidate() {
      let d = dispatcher();
      let sub = d.create_subscription(None).unwrap();
      d.attach_to_query(fingerprint("q"), &sub).unwrap();

      assert!(d.unregister(sub.id()));
      assert!(!d.unregister(sub.id()));
      assert!(!sub.is_invalidated());
      assert_eq!(d.registration_count(), 0);
      assert!(!d.is_sweep_armed());
   }

   #[tokio::test]
   async fn test_invalidate_server_only_touches_bound() {
      let d = dispatcher();
      let on_db1 = d.create_subscription(None).unwrap();
      let on_db2 = d.create_subscription(None).unwrap();
      on_db1.bind_server("db1");
      on_db2.bind_server("db2");

      assert_eq!(d.invalidate_server("db1", Notification::server_failure()), 1);
      assert!(on_db1.is_invalidated());
      assert!(!on_db2.is_invalidated());
      assert_eq!(d.subscription_count(), 1);
   }

   #[tokio::test]
   async fn test_callback_may_reenter_dispatcher() {
      let d = dispatcher();
      let sub = d.create_subscription(None).unwrap();
      let key = d.attach_to_query(fingerprint("q"), &sub).unwrap();

      let weak = Arc::downgrade(&d);
      sub.on_change(move |_| {
         let d = weak.upgrade().unwrap();
         d.create_subscription(None).unwrap();
      });

      d.on_message(key.suffix(), change());
      assert_eq!(d.subscription_count(), 1);
   }

   #[tokio::test]
   async fn test_enlist_without_registry_fails() {
      let d = dispatcher();
      let sub = d.create_subscription(None).unwrap();
      let target = CommandTarget::new(ConnectionParams::parse("Data Source=db1"), "q");
      assert!(matches!(
         d.enlist(&sub, &target).unwrap_err(),
         Error::RegistryUnavailable
      ));
   }

   #[tokio::test]
   async fn test_zero_timeout_uses_default() {
      let d = dispatcher();
      let sub = d.create_subscription(Some(Duration::ZERO)).unwrap();
      assert_eq!(sub.timeout(), d.config().default_timeout());
   }

   #[test]
   fn test_new_outside_runtime_fails() {
      let err = ConsumerDispatcher::new("c", DispatcherConfig::default(), Weak::new()).unwrap_err();
      assert!(matches!(err, Error::RuntimeUnavailable));
   }

   // ============================================================================
   // Sweep
   // ============================================================================

   #[tokio::test(start_paused = true)]
   async fn test_sweep_is_cheap_before_expiration() {
      let d = dispatcher();
      let sub = d.create_subscription(Some(Duration::from_secs(5))).unwrap();
      assert_eq!(d.sweep_now(), 0);
      assert!(!sub.is_invalidated());
   }

   #[tokio::test(start_paused = true)]
   async fn test_sweep_timer_invalidates_expired() {
      let d = dispatcher();
      let short = d.create_subscription(Some(Duration::from_secs(5))).unwrap();
      let long = d.create_subscription(Some(Duration::from_secs(100))).unwrap();
      assert!(d.is_sweep_armed());

      tokio::time::sleep(Duration::from_secs(16)).await;
      assert!(short.is_invalidated());
      assert_eq!(short.notification().unwrap().source, NotificationSource::Timeout);
      assert!(!long.is_invalidated());
      assert!(d.is_sweep_armed());

      tokio::time::sleep(Duration::from_secs(90)).await;
      assert!(long.is_invalidated());
      assert!(!d.is_sweep_armed());
   }

   #[tokio::test(start_paused = true)]
   async fn test_sweep_rearms_on_next_registration() {
      let d = dispatcher();
      let sub = d.create_subscription(None).unwrap();
      d.unregister(sub.id());
      assert!(!d.is_sweep_armed());

      d.create_subscription(None).unwrap();
      assert!(d.is_sweep_armed());
   }
}
