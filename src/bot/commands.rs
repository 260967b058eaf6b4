use once_cell::sync::Lazy;
use regex::Regex;

use crate::telegram::Update;

static SELECT_PLAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^select_plan_(\d+)_(\d+)$").expect("invalid regex"));
static CHECK_PAYMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^check_payment_(\d+)$").expect("invalid regex"));
static DISABLE_AUTO_RENEW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^disable_auto_renew_(\d+)$").expect("invalid regex"));
static RENEW_NOW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^renew_now_(\d+)$").expect("invalid regex"));

pub const PAY_PREFIX: &str = "pay_";

/// key: bot-commands -> text commands understood by the bot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    /// `/start` or `/start <bind token>`.
    Start { payload: Option<String> },
    /// `/start pay_<identifier>`.
    StartPay(String),
    Trial,
    Unknown,
}

impl BotCommand {
    pub fn parse(update: &Update) -> Option<Self> {
        let command = update.command()?;
        let text = update.text().unwrap_or_default().trim();
        let argument = text
            .split_once(char::is_whitespace)
            .map(|(_, rest)| rest.trim())
            .filter(|rest| !rest.is_empty());

        Some(match command.as_str() {
            "/start" => match argument {
                Some(payload) => match payload.strip_prefix(PAY_PREFIX) {
                    Some(identifier) if !identifier.is_empty() => {
                        BotCommand::StartPay(identifier.to_string())
                    }
                    _ => BotCommand::Start {
                        payload: Some(payload.to_string()),
                    },
                },
                None => BotCommand::Start { payload: None },
            },
            "/trial" => BotCommand::Trial,
            _ => BotCommand::Unknown,
        })
    }
}

/// key: bot-callbacks -> inline keyboard payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    SelectPlan { plan_id: i64, tenant_id: i64 },
    CheckPayment(i64),
    DisableAutoRenew(i64),
    RenewNow(i64),
    Unknown,
}

impl CallbackAction {
    pub fn parse(data: &str) -> Self {
        let data = data.trim();
        let id = |re: &Regex, index: usize| {
            re.captures(data)
                .and_then(|captures| captures.get(index))
                .and_then(|value| value.as_str().parse::<i64>().ok())
        };

        if let (Some(plan_id), Some(tenant_id)) = (id(&SELECT_PLAN, 1), id(&SELECT_PLAN, 2)) {
            return CallbackAction::SelectPlan { plan_id, tenant_id };
        }
        if let Some(payment_id) = id(&CHECK_PAYMENT, 1) {
            return CallbackAction::CheckPayment(payment_id);
        }
        if let Some(subscription_id) = id(&DISABLE_AUTO_RENEW, 1) {
            return CallbackAction::DisableAutoRenew(subscription_id);
        }
        if let Some(subscription_id) = id(&RENEW_NOW, 1) {
            return CallbackAction::RenewNow(subscription_id);
        }
        CallbackAction::Unknown
    }

    pub fn select_plan(plan_id: i64, tenant_id: i64) -> String {
        format!("select_plan_{plan_id}_{tenant_id}")
    }

    pub fn check_payment(payment_id: i64) -> String {
        format!("check_payment_{payment_id}")
    }
}
