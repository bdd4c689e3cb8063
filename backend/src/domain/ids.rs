//! Strongly typed identifiers for domain entities.
//!
//! Every aggregate is keyed by a UUID wrapped in a newtype so a voice id can
//! never be passed where a job id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
            ToSchema,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            pub fn from_uuid(value: Uuid) -> Self {
                Self(value)
            }

            /// Borrow the underlying UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }
    };
}

define_id!(
    /// Identity of a user account.
    UserId
);
define_id!(
    /// Identity of an uploaded voice.
    VoiceId
);
define_id!(
    /// Identity of a story.
    StoryId
);
define_id!(
    /// Identity of a synthesis job.
    JobId
);
define_id!(
    /// Identity of a credit lot.
    LotId
);
define_id!(
    /// Identity of a ledger transaction.
    TxId
);
define_id!(
    /// Identity of a slot audit event.
    EventId
);
