//! Billing errors

use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

/// Broad class of a billing failure, used to decide how callers react
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input; rejected before any state change
    Validation,
    /// The current state does not allow the request
    Conflict,
    NotFound,
    /// The payment gateway failed; safe to retry
    Integration,
    Security,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Target plan is the same as the current plan")]
    SamePlan,

    #[error("Target plan tier is not higher than the current plan")]
    NotAnUpgrade,

    #[error("Target plan tier is not lower than the current plan")]
    NotADowngrade,

    #[error("Seat count {requested} is below the {active} active employees")]
    SeatsBelowActive { requested: i32, active: i64 },

    #[error("Seat count must be at least 1")]
    InvalidSeatCount,

    #[error("Seat count is already {0}")]
    SameAsCurrentSeats(i32),

    #[error("Seat count must be higher than the current {0} seats")]
    NotASeatIncrease(i32),

    #[error("Seat count must be lower than the current {0} seats")]
    NotASeatDecrease(i32),

    #[error("Seat changes are not allowed while the subscription is past due")]
    CannotUpgradeDuringGracePeriod,

    #[error("Seats cannot be bought during a trial; check out a paid plan instead")]
    SeatIncreaseDuringTrial,

    #[error("A pending invoice already exists for this subscription")]
    PendingInvoiceExists,

    #[error("Requested {requested} seats but {active} employees are active")]
    InsufficientSeats { requested: i32, active: i64 },

    #[error("Plan {plan} allows at most {max_seats} seats")]
    ExceedsPlanMaxSeats { plan: String, max_seats: i32 },

    #[error("Subscription is {0}; start a new checkout instead")]
    SubscriptionInactive(String),

    #[error("Cannot move subscription from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Subscription changed concurrently, please retry")]
    ConcurrentUpdate,

    #[error("Tenant already has a subscription")]
    SubscriptionExists,

    #[error("Nothing is pending to cancel")]
    NothingPending,

    #[error("Plan {0} is not available")]
    PlanInactive(String),

    #[error("Subscription not found for tenant {0}")]
    SubscriptionNotFound(Uuid),

    #[error("Plan not found: {0}")]
    PlanNotFound(Uuid),

    #[error("Invoice not found: {0}")]
    InvoiceNotFound(String),

    #[error("Invalid webhook signature")]
    InvalidWebhookSignature,

    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("Billing period out of range: {0}")]
    InvalidPeriod(String),

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Corrupt billing record: {0}")]
    CorruptRecord(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// Stable machine-readable code surfaced to API clients
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::SamePlan => "SAME_PLAN",
            BillingError::NotAnUpgrade => "NOT_AN_UPGRADE",
            BillingError::NotADowngrade => "NOT_A_DOWNGRADE",
            BillingError::SeatsBelowActive { .. } => "SEATS_BELOW_ACTIVE",
            BillingError::InvalidSeatCount => "INVALID_SEAT_COUNT",
            BillingError::SameAsCurrentSeats(_) => "SAME_AS_CURRENT_SEATS",
            BillingError::NotASeatIncrease(_) => "NOT_A_SEAT_INCREASE",
            BillingError::NotASeatDecrease(_) => "NOT_A_SEAT_DECREASE",
            BillingError::CannotUpgradeDuringGracePeriod => "CANNOT_UPGRADE_DURING_GRACE_PERIOD",
            BillingError::SeatIncreaseDuringTrial => "SEAT_INCREASE_DURING_TRIAL",
            BillingError::PendingInvoiceExists => "PENDING_INVOICE_EXISTS",
            BillingError::InsufficientSeats { .. } => "INSUFFICIENT_SEATS",
            BillingError::ExceedsPlanMaxSeats { .. } => "EXCEEDS_PLAN_MAX_SEATS",
            BillingError::SubscriptionInactive(_) => "SUBSCRIPTION_INACTIVE",
            BillingError::InvalidTransition { .. } => "INVALID_TRANSITION",
            BillingError::ConcurrentUpdate => "CONCURRENT_UPDATE",
            BillingError::SubscriptionExists => "SUBSCRIPTION_EXISTS",
            BillingError::NothingPending => "NOTHING_PENDING",
            BillingError::PlanInactive(_) => "PLAN_INACTIVE",
            BillingError::SubscriptionNotFound(_) => "SUBSCRIPTION_NOT_FOUND",
            BillingError::PlanNotFound(_) => "PLAN_NOT_FOUND",
            BillingError::InvoiceNotFound(_) => "INVOICE_NOT_FOUND",
            BillingError::InvalidWebhookSignature => "INVALID_WEBHOOK_SIGNATURE",
            BillingError::InvalidPayload(_) => "INVALID_PAYLOAD",
            BillingError::InvalidPeriod(_) => "INVALID_PERIOD",
            BillingError::Gateway(_) => "PAYMENT_GATEWAY_UNAVAILABLE",
            BillingError::Timeout(_) => "TIMEOUT",
            BillingError::Database(_) => "INTERNAL",
            BillingError::CorruptRecord(_) => "INTERNAL",
            BillingError::Config(_) => "INTERNAL",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::SamePlan
            | BillingError::NotAnUpgrade
            | BillingError::NotADowngrade
            | BillingError::SeatsBelowActive { .. }
            | BillingError::InvalidSeatCount
            | BillingError::SameAsCurrentSeats(_)
            | BillingError::NotASeatIncrease(_)
            | BillingError::NotASeatDecrease(_)
            | BillingError::InsufficientSeats { .. }
            | BillingError::ExceedsPlanMaxSeats { .. }
            | BillingError::PlanInactive(_)
            | BillingError::InvalidPayload(_)
            | BillingError::InvalidPeriod(_) => ErrorKind::Validation,
            BillingError::CannotUpgradeDuringGracePeriod
            | BillingError::SeatIncreaseDuringTrial
            | BillingError::PendingInvoiceExists
            | BillingError::SubscriptionInactive(_)
            | BillingError::InvalidTransition { .. }
            | BillingError::ConcurrentUpdate
            | BillingError::SubscriptionExists
            | BillingError::NothingPending => ErrorKind::Conflict,
            BillingError::SubscriptionNotFound(_)
            | BillingError::PlanNotFound(_)
            | BillingError::InvoiceNotFound(_) => ErrorKind::NotFound,
            BillingError::Gateway(_) | BillingError::Timeout(_) => ErrorKind::Integration,
            BillingError::InvalidWebhookSignature => ErrorKind::Security,
            BillingError::Database(_)
            | BillingError::CorruptRecord(_)
            | BillingError::Config(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::Gateway(_) | BillingError::Timeout(_) | BillingError::Database(_)
        )
    }

    /// Message safe to show to a tenant; integration and internal failures
    /// never expose gateway or database details
    pub fn public_message(&self) -> String {
        match self.kind() {
            ErrorKind::Integration => {
                "Payment provider is temporarily unavailable, please try again".to_string()
            }
            ErrorKind::Internal => "Internal error, please try again".to_string(),
            _ => self.to_string(),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::Gateway(err.to_string())
    }
}

impl From<hris_shared::ParseEnumError> for BillingError {
    fn from(err: hris_shared::ParseEnumError) -> Self {
        BillingError::CorruptRecord(err.to_string())
    }
}
