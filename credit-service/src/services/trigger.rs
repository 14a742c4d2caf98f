//! Notification trigger: edge detection over successive reconciliation ticks.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{NotificationEvent, NotificationKind, NotificationMarks};

/// What the trigger looks at on one tick.
#[derive(Debug, Clone, Default)]
pub struct TriggerInput {
    pub low_credits: bool,
    pub depleted: bool,
    /// Expired credits that still had balance.
    pub expired_credits: Vec<Uuid>,
}

pub struct NotificationTrigger;

impl NotificationTrigger {
    /// Compares `input` with the marks left by earlier ticks and returns the
    /// events for the edges crossed now. `marks` is updated in place.
    ///
    /// The usage thresholds re-arm once the account is no longer low on
    /// credit. Expiry fires once per credit, ever.
    pub fn evaluate(
        marks: &mut NotificationMarks,
        account_id: Uuid,
        input: &TriggerInput,
        now: DateTime<Utc>,
    ) -> Vec<NotificationEvent> {
        let mut events = Vec::new();

        if input.low_credits {
            if !marks.eighty_fired {
                marks.eighty_fired = true;
                events.push(NotificationEvent::new(
                    account_id,
                    NotificationKind::EightyPercent,
                    None,
                    now,
                ));
            }
            if input.depleted && !marks.hundred_fired {
                marks.hundred_fired = true;
                events.push(NotificationEvent::new(
                    account_id,
                    NotificationKind::HundredPercent,
                    None,
                    now,
                ));
            }
        } else {
            marks.eighty_fired = false;
            marks.hundred_fired = false;
        }

        for credit_id in &input.expired_credits {
            if marks.expired_credits.insert(*credit_id) {
                events.push(NotificationEvent::new(
                    account_id,
                    NotificationKind::Expired,
                    Some(*credit_id),
                    now,
                ));
            }
        }

        events
    }
}
