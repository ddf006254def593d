//! Domain types for benefit requests.
//!
//! Identifiers, roles, the people involved in a request and the status enum
//! whose edge table every transition is checked against.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random id
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Creates an id from a UUID
            #[must_use]
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Returns the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a benefit request
    RequestId
);
uuid_id!(
    /// Identifier of a program user (staff member)
    UserId
);
uuid_id!(
    /// Identifier of a welfare unit
    UnitId
);
uuid_id!(
    /// Identifier of a citizen in the external registry
    CitizenId
);
uuid_id!(
    /// Identifier of a pendency item
    PendencyId
);
uuid_id!(
    /// Identifier of an audit entry
    AuditEntryId
);

macro_rules! code_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Wraps a code such as `"birth_allowance"`
            #[must_use]
            pub fn new(code: impl Into<String>) -> Self {
                Self(code.into())
            }

            /// Returns the code
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(code: &str) -> Self {
                Self(code.to_string())
            }
        }

        impl From<String> for $name {
            fn from(code: String) -> Self {
                Self(code)
            }
        }
    };
}

code_type!(
    /// Benefit type code (e.g. `birth_allowance`, `funeral_aid`)
    BenefitType
);
code_type!(
    /// Document type code (e.g. `responsibility_term`)
    DocumentType
);

/// Program roles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    /// Full access
    Admin,
    /// Unit or program manager
    Manager,
    /// Social worker issuing technical opinions
    TechnicalReviewer,
    /// Front-desk technician at a welfare unit
    UnitTechnician,
}

impl Role {
    /// Every role, in declaration order.
    pub const ALL: [Self; 4] = [
        Self::Admin,
        Self::Manager,
        Self::TechnicalReviewer,
        Self::UnitTechnician,
    ];
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Admin => "Admin",
            Self::Manager => "Manager",
            Self::TechnicalReviewer => "TechnicalReviewer",
            Self::UnitTechnician => "UnitTechnician",
        };
        f.write_str(name)
    }
}

/// Identity supplied by the identity provider on every call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Who is acting
    pub user_id: UserId,
    /// Roles held at call time
    pub roles: BTreeSet<Role>,
    /// Unit the actor works at
    pub unit_id: UnitId,
}

impl Actor {
    /// Build an actor from a role list.
    #[must_use]
    pub fn new(user_id: UserId, roles: impl IntoIterator<Item = Role>, unit_id: UnitId) -> Self {
        Self {
            user_id,
            roles: roles.into_iter().collect(),
            unit_id,
        }
    }

    /// True if the actor holds `role`.
    #[must_use]
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// True if the actor holds any of `roles`.
    #[must_use]
    pub fn has_any_role(&self, roles: &[Role]) -> bool {
        roles.iter().any(|role| self.has_role(*role))
    }
}

/// Full request-scoped actor context carried into history and audit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorContext {
    /// Authenticated actor
    pub actor: Actor,
    /// Client IP, when known
    pub ip_address: Option<String>,
    /// Client user agent, when known
    pub user_agent: Option<String>,
    /// Correlation id of the inbound call
    pub correlation_id: Uuid,
}

impl ActorContext {
    /// Context with a fresh correlation id and no client details.
    #[must_use]
    pub fn new(actor: Actor) -> Self {
        Self {
            actor,
            ip_address: None,
            user_agent: None,
            correlation_id: Uuid::new_v4(),
        }
    }

    /// Attach client network details.
    #[must_use]
    pub fn with_client(mut self, ip_address: impl Into<String>, user_agent: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Use a caller-provided correlation id.
    #[must_use]
    pub const fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }
}

/// How the request reached the program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    /// Filed at a welfare unit desk
    InPerson,
    /// Self-submitted through a messaging channel
    MessagingChannel,
}

/// Relationship of the requester to the beneficiary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kinship {
    /// Mother
    Mother,
    /// Father
    Father,
    /// Court-appointed legal guardian
    LegalGuardian,
    /// Grandparent
    Grandparent,
    /// Sibling
    Sibling,
    /// Any other relationship
    Other,
}

impl Kinship {
    /// First-degree legal representatives of a minor.
    #[must_use]
    pub const fn is_first_degree(self) -> bool {
        matches!(self, Self::Mother | Self::Father | Self::LegalGuardian)
    }
}

/// Age of legal majority.
pub const AGE_OF_MAJORITY: u32 = 18;

/// The person the benefit is for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beneficiary {
    /// Registry id
    pub citizen_id: CitizenId,
    /// Full name
    pub name: String,
    /// Date of birth
    pub birth_date: NaiveDate,
}

impl Beneficiary {
    /// True if the beneficiary is under [`AGE_OF_MAJORITY`] at `at`.
    #[must_use]
    pub fn is_minor_at(&self, at: DateTime<Utc>) -> bool {
        at.date_naive()
            .years_since(self.birth_date)
            .is_none_or(|age| age < AGE_OF_MAJORITY)
    }
}

/// The person filing the request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequesterInfo {
    /// Registry id
    pub citizen_id: CitizenId,
    /// Relationship to the beneficiary; `None` when filing for oneself
    pub kinship: Option<Kinship>,
}

/// How the benefit is paid out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentMethod {
    /// Instant transfer to the beneficiary's PIX key
    Pix,
    /// Deposit to a bank account
    BankTransfer,
    /// Benefit handed over in kind at the unit
    InKind,
}

/// Payment registered when the unit releases the benefit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentDetails {
    /// Amount in cents
    pub amount_cents: u64,
    /// Payment method
    pub method: PaymentMethod,
    /// External reference (transfer id, voucher number)
    pub reference: Option<String>,
}

/// Payment channel data held by the beneficiary data source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentChannel {
    /// PIX key
    Pix {
        /// The key (CPF, phone, e-mail or random key)
        key: String,
    },
    /// Bank account
    BankAccount {
        /// Bank code
        bank: String,
        /// Branch number
        branch: String,
        /// Account number
        account: String,
    },
}

/// Request status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RequestStatus {
    /// Created, not yet submitted
    Draft,
    /// Submitted, waiting for triage
    Open,
    /// Under technical analysis and approval
    InAnalysis,
    /// Waiting for pendencies to be resolved
    Pending,
    /// Approved, waiting for hand-over
    Approved,
    /// Benefit handed over
    Released,
    /// Delivery confirmed (terminal)
    Completed,
    /// Cancelled or rejected (terminal)
    Cancelled,
}

impl RequestStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 8] = [
        Self::Draft,
        Self::Open,
        Self::InAnalysis,
        Self::Pending,
        Self::Approved,
        Self::Released,
        Self::Completed,
        Self::Cancelled,
    ];

    /// Statuses reachable in one step.
    #[must_use]
    pub const fn allowed_targets(self) -> &'static [Self] {
        match self {
            Self::Draft => &[Self::Open, Self::Cancelled],
            Self::Open => &[Self::InAnalysis, Self::Cancelled],
            Self::InAnalysis => &[Self::Pending, Self::Approved, Self::Cancelled],
            Self::Pending => &[Self::InAnalysis, Self::Cancelled],
            Self::Approved => &[Self::Released, Self::Cancelled],
            Self::Released => &[Self::Completed],
            Self::Completed | Self::Cancelled => &[],
        }
    }

    /// True if `self -> to` is an edge of the state table.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        self.allowed_targets().contains(&to)
    }

    /// True for `Completed` and `Cancelled`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Draft => "Draft",
            Self::Open => "Open",
            Self::InAnalysis => "InAnalysis",
            Self::Pending => "Pending",
            Self::Approved => "Approved",
            Self::Released => "Released",
            Self::Completed => "Completed",
            Self::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}
