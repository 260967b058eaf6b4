use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::mpsc::{channel, error::TrySendError, Sender};
use tracing::{debug, error, info, warn};

use super::models::{display_time, PaymentStatus, Subscription, SubscriptionPayment};
use super::service::{Activation, BillingError, BillingService};
use crate::telegram::{deliver, ChatGateway, Outbound, RetryPolicy};
use crate::tenants::TenantDirectory;

/// Whether a successful activation should also be announced in chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyPolicy {
    Notify,
    /// The caller narrates the outcome itself.
    Suppress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationNotice {
    pub tenant_id: i64,
    pub plan_name: String,
    pub paid_until: Option<DateTime<Utc>>,
}

impl ActivationNotice {
    pub fn text(&self) -> String {
        let until = self
            .paid_until
            .map(display_time)
            .unwrap_or_else(|| "-".to_string());
        format!(
            "Subscription activated!\n\nPlan: {}\nValid until: {}",
            self.plan_name, until
        )
    }
}

/// key: billing-notifier-handle -> fire-and-forget activation notices
#[derive(Clone)]
pub struct NotificationHandle {
    sender: Option<Sender<ActivationNotice>>,
}

impl NotificationHandle {
    /// A handle that drops every notice; used when no bot credential is configured.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn notify(&self, notice: ActivationNotice) {
        let Some(sender) = &self.sender else {
            debug!(tenant_id = notice.tenant_id, "chat notifications disabled; notice dropped");
            return;
        };
        match sender.try_send(notice) {
            Ok(()) => {}
            Err(TrySendError::Full(notice)) => {
                warn!(tenant_id = notice.tenant_id, "notification queue full; notice dropped")
            }
            Err(TrySendError::Closed(notice)) => {
                warn!(tenant_id = notice.tenant_id, "notification worker stopped; notice dropped")
            }
        }
    }
}

/// key: billing-notifier -> background delivery of activation notices
pub fn start_notification_worker(
    pool: PgPool,
    gateway: Arc<dyn ChatGateway>,
    policy: RetryPolicy,
) -> NotificationHandle {
    let (tx, mut rx) = channel::<ActivationNotice>(64);
    tokio::spawn(async move {
        let directory = TenantDirectory::new(pool);
        while let Some(notice) = rx.recv().await {
            let chat_id = match directory.notification_chat(notice.tenant_id).await {
                Ok(Some(chat_id)) => chat_id,
                Ok(None) => {
                    debug!(tenant_id = notice.tenant_id, "tenant has no notification chat");
                    continue;
                }
                Err(err) => {
                    error!(?err, tenant_id = notice.tenant_id, "failed to resolve notification chat");
                    continue;
                }
            };
            let action = Outbound::Reply {
                chat_id,
                text: notice.text(),
                keyboard: None,
            };
            match deliver(gateway.as_ref(), &action, policy).await {
                Ok(()) => info!(tenant_id = notice.tenant_id, %chat_id, "activation notice delivered"),
                Err(err) => error!(
                    ?err,
                    tenant_id = notice.tenant_id,
                    %chat_id,
                    "activation notice dropped"
                ),
            }
        }
    });

    NotificationHandle { sender: Some(tx) }
}

/// Local metadata carried by a gateway event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventMetadata {
    pub tenant_id: Option<i64>,
    pub plan_id: Option<i64>,
    pub payment_id: Option<i64>,
}

impl EventMetadata {
    /// Metadata values arrive as strings or numbers; anything else is ignored.
    pub fn from_value(value: Option<&Value>) -> Self {
        let field = |name: &str| {
            value
                .and_then(|metadata| metadata.get(name))
                .and_then(|raw| match raw {
                    Value::Number(number) => number.as_i64(),
                    Value::String(text) => text.trim().parse().ok(),
                    _ => None,
                })
        };
        Self {
            tenant_id: field("tenant_id"),
            plan_id: field("plan_id"),
            payment_id: field("payment_id"),
        }
    }
}

/// A payment notification pushed by the gateway.
#[derive(Debug, Clone)]
pub struct GatewayEvent {
    pub event: String,
    pub gateway_payment_id: String,
    pub metadata: EventMetadata,
    pub payload: Value,
}

impl GatewayEvent {
    pub fn is_success(&self) -> bool {
        self.event == "payment.succeeded"
    }

    pub fn is_cancellation(&self) -> bool {
        self.event == "payment.canceled"
    }
}

#[derive(Debug, Clone)]
pub enum ReconcileOutcome {
    /// Activated by this call.
    Succeeded(Subscription),
    AlreadyProcessed(Option<Subscription>),
    Canceled,
    Pending,
    /// The gateway could not be asked; local state is unchanged.
    Unavailable(String),
    NotFound,
    Ignored,
}

impl ReconcileOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Succeeded(_) => "ok",
            ReconcileOutcome::AlreadyProcessed(_) => "already_processed",
            ReconcileOutcome::Canceled => "canceled",
            ReconcileOutcome::Pending => "pending",
            ReconcileOutcome::Unavailable(_) => "unavailable",
            ReconcileOutcome::NotFound => "not_found",
            ReconcileOutcome::Ignored => "ignored",
        }
    }
}

/// key: billing-reconciliation -> push (webhook) and pull (status check) paths into activation
#[derive(Clone)]
pub struct Reconciliation {
    billing: BillingService,
    notifier: NotificationHandle,
}

impl Reconciliation {
    pub fn new(billing: BillingService, notifier: NotificationHandle) -> Self {
        Self { billing, notifier }
    }

    pub fn billing(&self) -> &BillingService {
        &self.billing
    }

    pub async fn handle_gateway_event(
        &self,
        event: &GatewayEvent,
    ) -> Result<ReconcileOutcome, BillingError> {
        if !event.is_success() && !event.is_cancellation() {
            debug!(event = %event.event, gateway_payment_id = %event.gateway_payment_id, "gateway event ignored");
            return Ok(ReconcileOutcome::Ignored);
        }

        let payment = match self.locate_payment(event).await? {
            Located::Found(payment) => payment,
            Located::Unverified(reason) => return Ok(ReconcileOutcome::Unavailable(reason)),
            Located::Missing => {
                error!(
                    event = %event.event,
                    gateway_payment_id = %event.gateway_payment_id,
                    metadata = ?event.metadata,
                    "gateway event references an unknown payment"
                );
                return Ok(ReconcileOutcome::NotFound);
            }
        };

        if let Some(claimed) = event.metadata.tenant_id {
            if claimed != payment.tenant_id {
                error!(
                    payment_id = payment.id,
                    owner = payment.tenant_id,
                    claimed,
                    "gateway event tenant does not match payment owner"
                );
                return Err(BillingError::TenantMismatch {
                    payment_id: payment.id,
                    owner: payment.tenant_id,
                    claimed,
                });
            }
        }

        if payment.is_activated() {
            info!(payment_id = payment.id, event = %event.event, "gateway event for an already activated payment");
            let subscription = self
                .billing
                .existing_subscription(payment.tenant_id, Utc::now())
                .await?;
            return Ok(ReconcileOutcome::AlreadyProcessed(subscription));
        }

        self.billing.record_snapshot(payment.id, &event.payload).await?;
        if event.is_cancellation() {
            self.billing.mark_canceled(payment.id).await?;
            return Ok(ReconcileOutcome::Canceled);
        }
        self.activate(payment.id, NotifyPolicy::Notify).await
    }

    /// Pull path: asks the gateway about one of the tenant's payments.
    pub async fn check_payment(
        &self,
        tenant_id: i64,
        payment_id: i64,
        policy: NotifyPolicy,
    ) -> Result<ReconcileOutcome, BillingError> {
        let Some(payment) = self.billing.payment_for_tenant(tenant_id, payment_id).await? else {
            warn!(%tenant_id, %payment_id, "payment check for unknown or foreign payment");
            return Ok(ReconcileOutcome::NotFound);
        };
        self.refresh(payment, policy).await
    }

    /// Reconciles the tenant's newest pending payment, if there is one.
    pub async fn refresh_latest(&self, tenant_id: i64) -> Result<Option<ReconcileOutcome>, BillingError> {
        match self.billing.latest_pending_payment(tenant_id).await? {
            Some(payment) => Ok(Some(self.refresh(payment, NotifyPolicy::Notify).await?)),
            None => Ok(None),
        }
    }

    async fn refresh(
        &self,
        payment: SubscriptionPayment,
        policy: NotifyPolicy,
    ) -> Result<ReconcileOutcome, BillingError> {
        if payment.is_activated() {
            let subscription = self
                .billing
                .existing_subscription(payment.tenant_id, Utc::now())
                .await?;
            return Ok(ReconcileOutcome::AlreadyProcessed(subscription));
        }
        match payment.status {
            PaymentStatus::Canceled => return Ok(ReconcileOutcome::Canceled),
            PaymentStatus::Succeeded => return self.activate(payment.id, policy).await,
            PaymentStatus::Pending => {}
        }
        if payment.has_placeholder_id() {
            return Ok(ReconcileOutcome::Pending);
        }

        let snapshot = match self
            .billing
            .gateway()
            .get_status(&payment.gateway_payment_id)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(?err, payment_id = payment.id, "payment status unavailable");
                return Ok(ReconcileOutcome::Unavailable(err.to_string()));
            }
        };
        self.billing.record_snapshot(payment.id, &snapshot.raw).await?;

        match snapshot.status {
            PaymentStatus::Succeeded => self.activate(payment.id, policy).await,
            PaymentStatus::Canceled => {
                self.billing.mark_canceled(payment.id).await?;
                Ok(ReconcileOutcome::Canceled)
            }
            PaymentStatus::Pending => Ok(ReconcileOutcome::Pending),
        }
    }

    async fn activate(
        &self,
        payment_id: i64,
        policy: NotifyPolicy,
    ) -> Result<ReconcileOutcome, BillingError> {
        match self.billing.activate(payment_id).await? {
            Activation::Activated { subscription, plan } => {
                if policy == NotifyPolicy::Notify {
                    self.notifier.notify(ActivationNotice {
                        tenant_id: subscription.tenant_id,
                        plan_name: plan.name,
                        paid_until: subscription.paid_until,
                    });
                }
                Ok(ReconcileOutcome::Succeeded(subscription))
            }
            Activation::NoOp { subscription } => {
                Ok(ReconcileOutcome::AlreadyProcessed(Some(subscription)))
            }
        }
    }

    /// Matches by gateway id. A metadata match is only trusted for a row that
    /// still carries a placeholder id, and only once the gateway itself confirms
    /// the event.
    async fn locate_payment(&self, event: &GatewayEvent) -> Result<Located, BillingError> {
        if let Some(payment) = self
            .billing
            .payment_by_gateway_id(&event.gateway_payment_id)
            .await?
        {
            return Ok(Located::Found(payment));
        }
        let (Some(payment_id), Some(tenant_id)) =
            (event.metadata.payment_id, event.metadata.tenant_id)
        else {
            return Ok(Located::Missing);
        };
        let Some(payment) = self.billing.payment_for_tenant(tenant_id, payment_id).await? else {
            return Ok(Located::Missing);
        };
        if !payment.has_placeholder_id() {
            warn!(
                payment_id = payment.id,
                bound_to = %payment.gateway_payment_id,
                claimed = %event.gateway_payment_id,
                "gateway event names a payment bound to another gateway id"
            );
            return Ok(Located::Missing);
        }
        if payment.is_activated() {
            return Ok(Located::Found(payment));
        }

        let snapshot = match self
            .billing
            .gateway()
            .get_status(&event.gateway_payment_id)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(?err, payment_id = payment.id, "cannot confirm gateway event for placeholder payment");
                return Ok(Located::Unverified(err.to_string()));
            }
        };
        let expected = if event.is_success() {
            PaymentStatus::Succeeded
        } else {
            PaymentStatus::Canceled
        };
        let recorded = EventMetadata::from_value(snapshot.raw.get("metadata"));
        if snapshot.gateway_payment_id != event.gateway_payment_id
            || snapshot.status != expected
            || recorded.payment_id != Some(payment.id)
        {
            warn!(
                payment_id = payment.id,
                gateway_payment_id = %event.gateway_payment_id,
                status = ?snapshot.status,
                recorded = ?recorded,
                "gateway does not confirm event for placeholder payment"
            );
            return Ok(Located::Missing);
        }

        self.billing
            .adopt_gateway_id(payment.id, &event.gateway_payment_id)
            .await?;
        Ok(Located::Found(payment))
    }
}

enum Located {
    Found(SubscriptionPayment),
    Missing,
    /// A placeholder row matched but the gateway could not be asked.
    Unverified(String),
}
