//! Lead lifecycle: creation and status moves emit notifications.

use crate::db::{DbError, Lead, LeadStatus, NewLead, SharedDb};
use crate::notifications::NotificationService;

pub fn create_lead(
    db: &SharedDb,
    notifications: &NotificationService,
    user_id: &str,
    input: &NewLead,
) -> Result<Lead, DbError> {
    let lead = db.lock().create_lead(user_id, input)?;
    notifications.notify_new_lead(user_id, &lead.name, &lead.id);
    Ok(lead)
}

/// Move a lead to `status`. Setting the status it already has is a no-op
/// for notifications.
pub fn set_lead_status(
    db: &SharedDb,
    notifications: &NotificationService,
    user_id: &str,
    lead_id: &str,
    status: LeadStatus,
) -> Result<Lead, DbError> {
    let (previous, lead) = {
        let db = db.lock();
        let previous = db.get_lead(user_id, lead_id)?.status;
        (previous, db.set_lead_status(user_id, lead_id, status)?)
    };

    if previous != status {
        log::info!("Lead {} moved from {} to {}", lead.id, previous, status);
        notifications.notify_lead_status_changed(user_id, &lead.name, status.as_str(), &lead.id);
    }
    Ok(lead)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::db::NotificationQuery;

    fn new_lead() -> NewLead {
        NewLead {
            name: "Maria Souza".to_string(),
            email: "maria@exemplo.com".to_string(),
            source: "site".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_emits_new_lead() {
        let db = test_db().into_shared();
        let notifications = NotificationService::new(db.clone());

        let lead = create_lead(&db, &notifications, "u1", &new_lead()).unwrap();
        let page = notifications
            .list("u1", &NotificationQuery::default())
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.notifications[0].metadata["variables"]["lead_id"], lead.id.as_str());
    }

    #[test]
    fn test_invalid_lead_emits_nothing() {
        let db = test_db().into_shared();
        let notifications = NotificationService::new(db.clone());

        let mut input = new_lead();
        input.email = "sem-arroba".to_string();
        assert!(create_lead(&db, &notifications, "u1", &input).is_err());
        assert_eq!(notifications.unread_count("u1").unwrap(), 0);
    }

    #[test]
    fn test_status_change_emits_only_on_change() {
        let db = test_db().into_shared();
        let notifications = NotificationService::new(db.clone());
        let lead = db.lock().create_lead("u1", &new_lead()).unwrap();

        set_lead_status(&db, &notifications, "u1", &lead.id, LeadStatus::New).unwrap();
        assert_eq!(notifications.unread_count("u1").unwrap(), 0);

        let moved =
            set_lead_status(&db, &notifications, "u1", &lead.id, LeadStatus::Qualified).unwrap();
        assert_eq!(moved.status, LeadStatus::Qualified);
        assert_eq!(notifications.unread_count("u1").unwrap(), 1);

        let err = set_lead_status(&db, &notifications, "u1", "missing", LeadStatus::Lost);
        assert!(matches!(err, Err(DbError::NotFound { .. })));
    }
}
