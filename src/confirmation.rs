use std::fmt;
use std::fmt::Write as _;

use async_trait::async_trait;

use crate::cart::CartItem;
use crate::model::*;

#[derive(Debug)]
pub enum NotifyError {
    InvalidRecipient(String),
    Delivery(String),
}

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyError::InvalidRecipient(r) => write!(f, "invalid recipient: {r:?}"),
            NotifyError::Delivery(e) => write!(f, "delivery failed: {e}"),
        }
    }
}

impl std::error::Error for NotifyError {}

/// Outbound message channel (mail, SMS, ...).
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn send(&self, recipient: &str, subject: &str, content: &str) -> Result<(), NotifyError>;
}

/// The person checking out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Customer {
    pub user_id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub recipient: String,
    pub subject: String,
    pub content: String,
}

const UNKNOWN: &str = "not provided";

/// Render the confirmation for a committed order. `None` when the customer
/// has no address to send to.
pub fn render_confirmation(order: &Order, items: &[CartItem], customer: &Customer) -> Option<Confirmation> {
    let recipient = customer.email.clone()?;
    let mut content = String::new();
    let _ = writeln!(content, "Hello {},", customer.name.as_deref().unwrap_or(&customer.user_id));
    let _ = writeln!(content);
    let _ = writeln!(
        content,
        "Order {} placed {}",
        order.id,
        order.order_date.format("%d/%m/%Y %H:%M")
    );
    for item in items {
        let _ = writeln!(
            content,
            "  {} ({}) {}",
            item.facility_name.as_deref().unwrap_or("facility"),
            item.key(),
            item.total
        );
    }
    let _ = writeln!(content, "Total: {}", order.total_price);
    let location = items
        .first()
        .and_then(|i| i.location.as_deref())
        .unwrap_or(UNKNOWN);
    let _ = writeln!(content, "Location: {location}");
    let _ = writeln!(content, "Phone: {}", customer.phone.as_deref().unwrap_or(UNKNOWN));
    let _ = writeln!(content, "Email: {recipient}");

    Some(Confirmation {
        subject: format!("Booking confirmation #{}", order.id),
        recipient,
        content,
    })
}

/// Send a confirmation; failures are logged and counted, never returned.
pub async fn deliver(notifier: &dyn Notifier, order_id: ulid::Ulid, confirmation: &Confirmation) -> bool {
    match notifier
        .send(&confirmation.recipient, &confirmation.subject, &confirmation.content)
        .await
    {
        Ok(()) => {
            tracing::info!("confirmation for order {order_id} sent to {}", confirmation.recipient);
            true
        }
        Err(e) => {
            metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL).increment(1);
            tracing::error!("confirmation for order {order_id} to {} failed: {e}", confirmation.recipient);
            false
        }
    }
}

/// Writes messages to the log instead of delivering them.
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send(&self, recipient: &str, subject: &str, content: &str) -> Result<(), NotifyError> {
        let valid = recipient
            .split_once('@')
            .is_some_and(|(user, domain)| !user.is_empty() && domain.contains('.'));
        if !valid {
            return Err(NotifyError::InvalidRecipient(recipient.to_string()));
        }
        tracing::info!(%recipient, %subject, "{content}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use ulid::Ulid;

    fn order_and_items() -> (Order, Vec<CartItem>) {
        let facility = Facility {
            id: Ulid::new(),
            name: "Court 1".into(),
            location: "North hall".into(),
            price_per_hour: 100,
            open: TimeOfDay::hm(6, 0),
            close: TimeOfDay::hm(22, 0),
        };
        let date = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        let items: Vec<CartItem> = [10, 11]
            .into_iter()
            .map(|h| {
                let slot = Slot::available(facility.id, date, TimeOfDay::hm(h, 0), TimeOfDay::hm(h + 1, 0));
                CartItem::for_slot(&facility, &slot)
            })
            .collect();
        let order = Order {
            id: Ulid::new(),
            user_id: "u1".into(),
            order_date: Utc.with_ymd_and_hms(2026, 5, 30, 9, 15, 0).unwrap(),
            total_price: 200,
            details: Vec::new(),
        };
        (order, items)
    }

    fn customer(email: Option<&str>) -> Customer {
        Customer {
            user_id: "u1".into(),
            name: Some("Lan".into()),
            email: email.map(String::from),
            phone: None,
        }
    }

    #[test]
    fn renders_lines_and_total() {
        let (order, items) = order_and_items();
        let c = render_confirmation(&order, &items, &customer(Some("lan@example.com"))).unwrap();
        assert_eq!(c.recipient, "lan@example.com");
        assert_eq!(c.subject, format!("Booking confirmation #{}", order.id));
        assert!(c.content.contains("Hello Lan,"));
        assert!(c.content.contains("placed 30/05/2026 09:15"));
        assert!(c.content.contains("Court 1 (01/06/2026 10:00-11:00) 100"));
        assert!(c.content.contains("Court 1 (01/06/2026 11:00-12:00) 100"));
        assert!(c.content.contains("Total: 200"));
        assert!(c.content.contains("Location: North hall"));
        assert!(c.content.contains("Phone: not provided"));
    }

    #[test]
    fn no_email_no_confirmation() {
        let (order, items) = order_and_items();
        assert!(render_confirmation(&order, &items, &customer(None)).is_none());
    }

    #[tokio::test]
    async fn tracing_notifier_rejects_bad_address() {
        let n = TracingNotifier;
        assert!(n.send("lan@example.com", "s", "c").await.is_ok());
        assert!(matches!(
            n.send("not-an-address", "s", "c").await,
            Err(NotifyError::InvalidRecipient(_))
        ));
    }

    #[tokio::test]
    async fn deliver_reports_failure() {
        let (order, items) = order_and_items();
        let mut c = render_confirmation(&order, &items, &customer(Some("lan@example.com"))).unwrap();
        assert!(deliver(&TracingNotifier, order.id, &c).await);
        c.recipient = "broken".into();
        assert!(!deliver(&TracingNotifier, order.id, &c).await);
    }
}
