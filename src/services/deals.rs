//! Deal lifecycle: closing a deal emits a won or lost notification.

use crate::db::{Deal, DealStatus, DbError, SharedDb};
use crate::notifications::NotificationService;

pub fn set_deal_status(
    db: &SharedDb,
    notifications: &NotificationService,
    user_id: &str,
    deal_id: &str,
    status: DealStatus,
) -> Result<Deal, DbError> {
    let (previous, deal) = {
        let db = db.lock();
        let previous = db.get_deal(user_id, deal_id)?.status;
        (previous, db.set_deal_status(user_id, deal_id, status)?)
    };
    if previous == status {
        return Ok(deal);
    }

    match status {
        DealStatus::ClosedWon => {
            notifications.notify_deal_won(user_id, &deal.title, &deal.value_label(), &deal.id);
        }
        DealStatus::ClosedLost => {
            notifications.notify_deal_lost(user_id, &deal.title, &deal.id);
        }
        DealStatus::Prospecting | DealStatus::Negotiation => {}
    }
    Ok(deal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::db::{NewContact, NewDeal, NotificationQuery};

    fn seed_deal(db: &SharedDb) -> Deal {
        let db = db.lock();
        let contact = db
            .create_contact(
                "u1",
                &NewContact {
                    name: "Ana".to_string(),
                    email: "ana@exemplo.com".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();
        db.create_deal(
            "u1",
            &NewDeal {
                title: "Contrato anual".to_string(),
                value: 15000.0,
                contact_id: contact.id,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_won_deal_notifies_with_value() {
        let db = test_db().into_shared();
        let notifications = NotificationService::new(db.clone());
        let deal = seed_deal(&db);

        set_deal_status(&db, &notifications, "u1", &deal.id, DealStatus::Negotiation).unwrap();
        assert_eq!(notifications.unread_count("u1").unwrap(), 0);

        set_deal_status(&db, &notifications, "u1", &deal.id, DealStatus::ClosedWon).unwrap();
        let page = notifications
            .list("u1", &NotificationQuery::default())
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.notifications[0].metadata["template_name"], "deal_won");
        assert_eq!(
            page.notifications[0].metadata["variables"]["deal_value"],
            "R$ 15000.00"
        );
    }

    #[test]
    fn test_lost_deal_notifies_once() {
        let db = test_db().into_shared();
        let notifications = NotificationService::new(db.clone());
        let deal = seed_deal(&db);

        set_deal_status(&db, &notifications, "u1", &deal.id, DealStatus::ClosedLost).unwrap();
        set_deal_status(&db, &notifications, "u1", &deal.id, DealStatus::ClosedLost).unwrap();
        assert_eq!(notifications.unread_count("u1").unwrap(), 1);
    }
}
