pub mod adapters;
pub mod api;
pub mod models;
pub mod reconciliation;
pub mod scheduler;
pub mod service;

pub use adapters::{
    gateway_from_env, CheckoutMetadata, CheckoutRequest, CheckoutSession, HttpPaymentGateway,
    PaymentGateway, PaymentGatewayError, PaymentSnapshot, UnconfiguredGateway,
};
pub use api::{
    access as billing_access, check_payment as billing_check_payment,
    create_payment as billing_create_payment, issue_bind_token as billing_issue_bind_token,
    list_plans as billing_list_plans, subscription_status as billing_subscription_status,
    CreatePaymentRequest, CreatePaymentResponse, PaymentCheckResponse,
    SubscriptionStatusResponse,
};
pub use models::{
    display_time, PaymentStatus, Plan, Subscription, SubscriptionPayment, SubscriptionStatus,
};
pub use reconciliation::{
    start_notification_worker, ActivationNotice, EventMetadata, GatewayEvent, NotificationHandle,
    NotifyPolicy, ReconcileOutcome, Reconciliation,
};
pub use scheduler::{process_tick as run_billing_reminder_tick, spawn as spawn_billing_scheduler};
pub use service::{
    extend_paid_until, Activation, AutoRenewChange, BillingError, BillingService, CheckoutOutcome,
};
