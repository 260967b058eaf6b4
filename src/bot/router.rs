use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tracing::{debug, error, info, warn};

use super::commands::{BotCommand, CallbackAction};
use super::{DispatchError, EventDispatcher};
use crate::billing::{
    display_time, AutoRenewChange, BillingError, BillingService, NotifyPolicy, ReconcileOutcome,
    Reconciliation, SubscriptionStatus,
};
use crate::config;
use crate::telegram::{
    BotEvent, CallbackQuery, InlineKeyboardButton, InlineKeyboardMarkup, SideEffects, Update,
};
use crate::tenants::{
    resolve_start_payload, BindTokenError, BotLinks, Tenant, TenantDirectory, TenantError,
    TenantIdentifier,
};

const CONNECT_HINT: &str =
    "To connect Telegram, use the \"Connect Telegram\" button in your dashboard.";
const INVALID_LINK: &str =
    "This link is invalid or has expired. Open the dashboard and press \"Connect Telegram\" again.";
const ACCOUNT_NOT_FOUND: &str =
    "Account not found. Open the payment link from your dashboard again.";
const NOT_LINKED: &str = "Telegram link is not configured. Use the \"Connect Telegram\" button in your dashboard.";
const NO_PLANS: &str = "No subscription plans are available right now.";
const HANDLER_FAILED: &str = "Something went wrong. Please try again in a minute.";
const LINKED_ELSEWHERE: &str = "This account is already connected to another Telegram chat. Use the \"Connect Telegram\" button in your dashboard to move it.";

/// key: bot-router -> stateless per-event dispatch for commands and callbacks
#[derive(Clone)]
pub struct BotRouter {
    directory: TenantDirectory,
    links: BotLinks,
    reconciliation: Reconciliation,
    bind_secret: String,
    bind_max_age_secs: i64,
}

impl BotRouter {
    pub fn new(
        pool: PgPool,
        reconciliation: Reconciliation,
        bind_secret: impl Into<String>,
        bind_max_age_secs: i64,
    ) -> Self {
        Self {
            directory: TenantDirectory::new(pool.clone()),
            links: BotLinks::new(pool),
            reconciliation,
            bind_secret: bind_secret.into(),
            bind_max_age_secs,
        }
    }

    pub fn from_env(pool: PgPool, reconciliation: Reconciliation) -> Self {
        Self::new(
            pool,
            reconciliation,
            config::BIND_TOKEN_SECRET.as_str(),
            *config::BIND_TOKEN_MAX_AGE_SECS,
        )
    }

    fn billing(&self) -> &BillingService {
        self.reconciliation.billing()
    }

    async fn handle_message(&self, update: &Update) -> Result<SideEffects, DispatchError> {
        let mut effects = SideEffects::none();
        let (Some(chat_id), Some(command)) = (update.chat_id(), BotCommand::parse(update)) else {
            return Ok(effects);
        };
        let sender_id = update.sender_id().unwrap_or(chat_id);

        match command {
            BotCommand::Start { payload: None } => {
                effects.reply(chat_id, CONNECT_HINT);
            }
            BotCommand::Start {
                payload: Some(payload),
            } => {
                let resolved = resolve_start_payload(
                    &self.directory,
                    &payload,
                    &self.bind_secret,
                    self.bind_max_age_secs,
                    Utc::now().timestamp(),
                )
                .await;
                match resolved {
                    Ok(tenant) => {
                        self.bind(tenant.id, sender_id, chat_id).await?;
                        effects.reply(
                            chat_id,
                            format!(
                                "Telegram connected to {}. Payment and subscription notices will arrive here.",
                                tenant.name
                            ),
                        );
                    }
                    Err(BindTokenError::Db(err)) => return Err(err.into()),
                    Err(reason) => {
                        info!(%chat_id, %sender_id, %reason, "start payload rejected");
                        effects.reply(chat_id, INVALID_LINK);
                    }
                }
            }
            BotCommand::StartPay(identifier) => {
                let Some(identifier) = TenantIdentifier::parse(&identifier) else {
                    effects.reply(chat_id, INVALID_LINK);
                    return Ok(effects);
                };
                match self.directory.resolve(&identifier).await {
                    Ok(tenant) => {
                        if !self.may_claim(&tenant, sender_id, chat_id).await? {
                            warn!(%chat_id, %sender_id, tenant_id = tenant.id, "payment link for a tenant linked to another chat");
                            effects.reply(chat_id, LINKED_ELSEWHERE);
                            return Ok(effects);
                        }
                        self.bind(tenant.id, sender_id, chat_id).await?;
                        self.plan_catalog(&mut effects, chat_id, tenant.id).await?;
                    }
                    Err(TenantError::NotFound) => {
                        info!(%chat_id, %sender_id, "payment link names no active tenant");
                        effects.reply(chat_id, ACCOUNT_NOT_FOUND);
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            BotCommand::Trial => self.trial(&mut effects, chat_id, sender_id).await?,
            BotCommand::Unknown => {
                debug!(update_id = update.update_id, "unrecognised command");
            }
        }
        Ok(effects)
    }

    /// Every callback is answered, including when its handler fails.
    async fn handle_callback(
        &self,
        update: &Update,
        callback: &CallbackQuery,
    ) -> Result<SideEffects, DispatchError> {
        let mut effects = SideEffects::none();
        effects.answer_callback(callback.id.clone());
        if let Err(err) = self.run_callback(&mut effects, update, callback).await {
            error!(?err, update_id = update.update_id, "callback handler failed");
            effects.reply(
                update.chat_id().unwrap_or(callback.from.id),
                HANDLER_FAILED,
            );
        }
        Ok(effects)
    }

    async fn run_callback(
        &self,
        effects: &mut SideEffects,
        update: &Update,
        callback: &CallbackQuery,
    ) -> Result<(), DispatchError> {
        let sender_id = callback.from.id;
        let chat_id = update.chat_id().unwrap_or(sender_id);
        let Some(data) = callback.data.as_deref() else {
            return Ok(());
        };

        match CallbackAction::parse(data) {
            CallbackAction::SelectPlan { plan_id, tenant_id } => {
                self.select_plan(effects, chat_id, sender_id, plan_id, tenant_id)
                    .await?
            }
            CallbackAction::CheckPayment(payment_id) => {
                self.check_payment(effects, chat_id, sender_id, payment_id)
                    .await?
            }
            CallbackAction::DisableAutoRenew(subscription_id) => {
                let Some(tenant_id) = self.linked_tenant(sender_id, chat_id).await? else {
                    effects.reply(chat_id, NOT_LINKED);
                    return Ok(());
                };
                let text = match self
                    .billing()
                    .disable_auto_renew(tenant_id, subscription_id)
                    .await
                {
                    Ok(AutoRenewChange::Disabled(_)) => "Auto-renew disabled.",
                    Ok(AutoRenewChange::AlreadyDisabled(_)) => "Auto-renew is already disabled.",
                    Err(BillingError::SubscriptionNotFound) => "Subscription not found.",
                    Err(err) => return Err(err.into()),
                };
                effects.reply(chat_id, text);
            }
            CallbackAction::RenewNow(subscription_id) => {
                let Some(tenant_id) = self.linked_tenant(sender_id, chat_id).await? else {
                    effects.reply(chat_id, NOT_LINKED);
                    return Ok(());
                };
                let owned = self
                    .billing()
                    .existing_subscription(tenant_id, Utc::now())
                    .await?
                    .map_or(false, |subscription| subscription.id == subscription_id);
                if owned {
                    self.plan_catalog(effects, chat_id, tenant_id).await?;
                } else {
                    effects.reply(chat_id, "Subscription not found.");
                }
            }
            CallbackAction::Unknown => {
                warn!(update_id = update.update_id, %data, "unrecognised callback payload");
            }
        }
        Ok(())
    }

    async fn select_plan(
        &self,
        effects: &mut SideEffects,
        chat_id: i64,
        sender_id: i64,
        plan_id: i64,
        tenant_id: i64,
    ) -> Result<(), DispatchError> {
        if self.linked_tenant(sender_id, chat_id).await? != Some(tenant_id) {
            warn!(%chat_id, %sender_id, %tenant_id, "plan selection for a tenant this chat is not linked to");
            effects.reply(chat_id, ACCOUNT_NOT_FOUND);
            return Ok(());
        }
        self.bind(tenant_id, sender_id, chat_id).await?;

        let outcome = match self.billing().create_checkout(tenant_id, plan_id).await {
            Ok(outcome) => outcome,
            Err(BillingError::PlanNotFound(_)) => {
                effects.reply(chat_id, "This plan is no longer available.");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let check = InlineKeyboardButton::callback(
            "Check payment",
            CallbackAction::check_payment(outcome.payment.id),
        );
        match outcome.confirmation_url {
            Some(url) => {
                effects.reply_with_keyboard(
                    chat_id,
                    format!(
                        "Plan: {}\nAmount: {} {}\n\nPay with the button below, then press \"Check payment\".",
                        outcome.plan.name,
                        outcome.plan.amount_value(),
                        outcome.plan.currency
                    ),
                    InlineKeyboardMarkup::column(vec![InlineKeyboardButton::link("Pay", url), check]),
                );
            }
            None => {
                effects.reply_with_keyboard(
                    chat_id,
                    "Payment confirmation is unavailable right now. Press \"Check payment\" in a few minutes or pay from the dashboard.",
                    InlineKeyboardMarkup::column(vec![check]),
                );
            }
        }
        Ok(())
    }

    async fn check_payment(
        &self,
        effects: &mut SideEffects,
        chat_id: i64,
        sender_id: i64,
        payment_id: i64,
    ) -> Result<(), DispatchError> {
        let Some(tenant_id) = self.linked_tenant(sender_id, chat_id).await? else {
            effects.reply(chat_id, NOT_LINKED);
            return Ok(());
        };
        let outcome = self
            .reconciliation
            .check_payment(tenant_id, payment_id, NotifyPolicy::Suppress)
            .await?;
        let text = match outcome {
            ReconcileOutcome::Succeeded(subscription) => format!(
                "Payment received! Subscription is active until {}.",
                subscription
                    .paid_until
                    .map(display_time)
                    .unwrap_or_else(|| "-".into())
            ),
            ReconcileOutcome::AlreadyProcessed(subscription) => {
                match subscription.and_then(|subscription| subscription.paid_until) {
                    Some(paid_until) => format!(
                        "This payment has already been applied. Subscription is active until {}.",
                        display_time(paid_until)
                    ),
                    None => "This payment has already been applied.".to_string(),
                }
            }
            ReconcileOutcome::Canceled => "The payment was canceled.".to_string(),
            ReconcileOutcome::Pending => {
                "Payment is still pending. Press \"Check payment\" again once you have paid."
                    .to_string()
            }
            ReconcileOutcome::Unavailable(_) => {
                "Could not reach the payment provider. Please try again in a minute.".to_string()
            }
            ReconcileOutcome::NotFound => "Payment not found.".to_string(),
            ReconcileOutcome::Ignored => return Ok(()),
        };
        effects.reply(chat_id, text);
        Ok(())
    }

    async fn trial(
        &self,
        effects: &mut SideEffects,
        chat_id: i64,
        sender_id: i64,
    ) -> Result<(), DispatchError> {
        let Some(tenant_id) = self.linked_tenant(sender_id, chat_id).await? else {
            effects.reply(chat_id, NOT_LINKED);
            return Ok(());
        };
        let now = Utc::now();
        let trial_until = self
            .billing()
            .existing_subscription(tenant_id, now)
            .await?
            .filter(|subscription| {
                subscription.is_trial && subscription.status == SubscriptionStatus::Active
            })
            .and_then(|subscription| subscription.paid_until);
        match trial_until {
            Some(paid_until) => effects.reply(
                chat_id,
                format!("Trial access is active until: {}", display_time(paid_until)),
            ),
            None => effects.reply(chat_id, "Trial is not active."),
        };
        Ok(())
    }

    async fn plan_catalog(
        &self,
        effects: &mut SideEffects,
        chat_id: i64,
        tenant_id: i64,
    ) -> Result<(), DispatchError> {
        let plans = self.billing().active_plans().await?;
        if plans.is_empty() {
            effects.reply(chat_id, NO_PLANS);
            return Ok(());
        }
        let buttons = plans
            .iter()
            .map(|plan| {
                InlineKeyboardButton::callback(
                    format!(
                        "{}: {} {} for {} days",
                        plan.name,
                        plan.amount_value(),
                        plan.currency,
                        plan.duration_days
                    ),
                    CallbackAction::select_plan(plan.id, tenant_id),
                )
            })
            .collect();
        effects.reply_with_keyboard(
            chat_id,
            "Choose a subscription plan:",
            InlineKeyboardMarkup::column(buttons),
        );
        Ok(())
    }

    /// A payment link may bind a tenant with no chat yet, or re-bind its own chat.
    async fn may_claim(&self, tenant: &Tenant, sender_id: i64, chat_id: i64) -> Result<bool, DispatchError> {
        if tenant.telegram_chat_id.map_or(false, |bound| bound != chat_id) {
            return Ok(false);
        }
        Ok(self
            .links
            .for_tenant(tenant.id)
            .await?
            .map_or(true, |link| link.bot_user_id == sender_id))
    }

    async fn bind(&self, tenant_id: i64, sender_id: i64, chat_id: i64) -> Result<(), DispatchError> {
        self.directory.bind_chat(tenant_id, chat_id).await?;
        self.links.upsert(sender_id, chat_id, tenant_id).await?;
        Ok(())
    }

    /// Tenant behind a chat: the bot-user link first, then the tenant's bound chat.
    async fn linked_tenant(&self, sender_id: i64, chat_id: i64) -> Result<Option<i64>, DispatchError> {
        if let Some(link) = self.links.by_bot_user(sender_id).await? {
            return Ok(Some(link.tenant_id));
        }
        Ok(self
            .directory
            .find_by_chat(chat_id)
            .await?
            .map(|tenant| tenant.id))
    }
}

#[async_trait]
impl EventDispatcher for BotRouter {
    async fn dispatch(&self, update: &Update) -> Result<SideEffects, DispatchError> {
        match &update.event {
            BotEvent::Message(_) => self.handle_message(update).await,
            BotEvent::CallbackQuery(callback) => self.handle_callback(update, callback).await,
            BotEvent::EditedMessage(_) | BotEvent::Unknown => {
                debug!(update_id = update.update_id, kind = update.kind(), "update not routed");
                Ok(SideEffects::none())
            }
        }
    }
}
