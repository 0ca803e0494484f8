//! In-memory adapters for the billing ports
//!
//! Used by the API server in development and by tests. Every adapter can be
//! shared behind an `Arc` and mutated through `&self`.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;
use uuid::Uuid;

use core_kernel::{DateRange, DomainPort, LessonId, OrgId, PortError, Timezone};

use crate::config::OrgBillingConfig;
use crate::lesson::Lesson;
use crate::outbox::OutboxEntry;
use crate::ports::{
    ChargeReceipt, ChargeRequest, LessonSource, Notifier, OrgConfigSource, PaymentGateway, RefundAck,
    RefundRequest,
};

/// Lesson records keyed by id
#[derive(Debug, Default)]
pub struct InMemoryLessonSource {
    lessons: DashMap<LessonId, Lesson>,
    unavailable: AtomicBool,
}

impl InMemoryLessonSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a lesson
    pub fn upsert(&self, lesson: Lesson) {
        self.lessons.insert(lesson.id, lesson);
    }

    pub fn get(&self, lesson_id: LessonId) -> Option<Lesson> {
        self.lessons.get(&lesson_id).map(|l| l.value().clone())
    }

    /// Simulates a scheduling-system outage
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

impl DomainPort for InMemoryLessonSource {}

#[async_trait]
impl LessonSource for InMemoryLessonSource {
    async fn lessons_in_range(
        &self,
        org_id: OrgId,
        range: &DateRange,
        timezone: &Timezone,
    ) -> Result<Vec<Lesson>, PortError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PortError::unavailable("scheduling"));
        }
        let mut lessons: Vec<Lesson> = self
            .lessons
            .iter()
            .filter(|l| l.org_id == org_id && range.contains_instant(l.start_at, timezone))
            .map(|l| l.value().clone())
            .collect();
        lessons.sort_by_key(|l| (l.start_at, l.id));
        Ok(lessons)
    }
}

/// Billing configuration keyed by organisation
#[derive(Debug, Default)]
pub struct InMemoryOrgConfigSource {
    configs: DashMap<OrgId, OrgBillingConfig>,
}

impl InMemoryOrgConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, org_id: OrgId, config: OrgBillingConfig) {
        self.configs.insert(org_id, config);
    }
}

impl DomainPort for InMemoryOrgConfigSource {}

#[async_trait]
impl OrgConfigSource for InMemoryOrgConfigSource {
    async fn billing_config(&self, org_id: OrgId) -> Result<OrgBillingConfig, PortError> {
        self.configs
            .get(&org_id)
            .map(|c| c.value().clone())
            .ok_or_else(|| PortError::not_found("OrgBillingConfig", org_id))
    }
}

/// Accepts every charge and refund unless switched off
#[derive(Debug, Default)]
pub struct InMemoryPaymentGateway {
    unavailable: AtomicBool,
    charges: Mutex<Vec<ChargeRequest>>,
    refunds: Mutex<Vec<RefundRequest>>,
}

impl InMemoryPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates a gateway outage
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn charges(&self) -> Vec<ChargeRequest> {
        self.charges.lock().clone()
    }

    pub fn refunds(&self) -> Vec<RefundRequest> {
        self.refunds.lock().clone()
    }

    fn check_available(&self) -> Result<(), PortError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PortError::unavailable("payment-gateway"));
        }
        Ok(())
    }
}

impl DomainPort for InMemoryPaymentGateway {}

#[async_trait]
impl PaymentGateway for InMemoryPaymentGateway {
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, PortError> {
        self.check_available()?;
        self.charges.lock().push(request.clone());
        Ok(ChargeReceipt {
            gateway_reference: format!("ch_{}", Uuid::new_v4().simple()),
            provider: "card".to_string(),
        })
    }

    async fn submit_refund(&self, request: &RefundRequest) -> Result<RefundAck, PortError> {
        self.check_available()?;
        self.refunds.lock().push(request.clone());
        Ok(RefundAck {
            gateway_reference: format!("re_{}", Uuid::new_v4().simple()),
        })
    }
}

/// Logs each event instead of delivering it
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl DomainPort for TracingNotifier {}

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, entry: &OutboxEntry) -> Result<(), PortError> {
        info!(
            org_id = %entry.org_id,
            event_id = %entry.id,
            event = entry.event.name(),
            "Billing notification"
        );
        Ok(())
    }
}

/// Captures delivered events; can be told to fail
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    delivered: Mutex<Vec<OutboxEntry>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn delivered(&self) -> Vec<OutboxEntry> {
        self.delivered.lock().clone()
    }
}

impl DomainPort for RecordingNotifier {}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, entry: &OutboxEntry) -> Result<(), PortError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PortError::connection("notifier offline"));
        }
        self.delivered.lock().push(entry.clone());
        Ok(())
    }
}
