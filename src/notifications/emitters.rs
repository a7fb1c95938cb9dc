//! One helper per built-in template, each filling its declared variables.

use super::template::vars;
use super::NotificationService;
use crate::db::Notification;

impl NotificationService {
    pub fn notify_new_lead(&self, user_id: &str, lead_name: &str, lead_id: &str) -> Option<Notification> {
        self.create_from_template(
            user_id,
            "new_lead",
            &vars([
                ("lead_name", lead_name.to_string()),
                ("lead_id", lead_id.to_string()),
            ]),
            None,
        )
    }

    pub fn notify_lead_status_changed(
        &self,
        user_id: &str,
        lead_name: &str,
        new_status: &str,
        lead_id: &str,
    ) -> Option<Notification> {
        self.create_from_template(
            user_id,
            "lead_status_changed",
            &vars([
                ("lead_name", lead_name.to_string()),
                ("new_status", new_status.to_string()),
                ("lead_id", lead_id.to_string()),
            ]),
            None,
        )
    }

    pub fn notify_deal_won(
        &self,
        user_id: &str,
        deal_title: &str,
        deal_value: &str,
        deal_id: &str,
    ) -> Option<Notification> {
        self.create_from_template(
            user_id,
            "deal_won",
            &vars([
                ("deal_title", deal_title.to_string()),
                ("deal_value", deal_value.to_string()),
                ("deal_id", deal_id.to_string()),
            ]),
            None,
        )
    }

    pub fn notify_deal_lost(&self, user_id: &str, deal_title: &str, deal_id: &str) -> Option<Notification> {
        self.create_from_template(
            user_id,
            "deal_lost",
            &vars([
                ("deal_title", deal_title.to_string()),
                ("deal_id", deal_id.to_string()),
            ]),
            None,
        )
    }

    pub fn notify_activity_reminder(
        &self,
        user_id: &str,
        activity_title: &str,
        activity_date: &str,
        activity_id: &str,
    ) -> Option<Notification> {
        self.create_from_template(
            user_id,
            "activity_reminder",
            &vars([
                ("activity_title", activity_title.to_string()),
                ("activity_date", activity_date.to_string()),
                ("activity_id", activity_id.to_string()),
            ]),
            None,
        )
    }

    pub fn notify_activity_overdue(
        &self,
        user_id: &str,
        activity_title: &str,
        due_date: &str,
        activity_id: &str,
    ) -> Option<Notification> {
        self.create_from_template(
            user_id,
            "activity_overdue",
            &vars([
                ("activity_title", activity_title.to_string()),
                ("due_date", due_date.to_string()),
                ("activity_id", activity_id.to_string()),
            ]),
            None,
        )
    }

    pub fn notify_integration_error(
        &self,
        user_id: &str,
        integration_name: &str,
        error_message: &str,
    ) -> Option<Notification> {
        self.create_from_template(
            user_id,
            "integration_error",
            &vars([
                ("integration_name", integration_name.to_string()),
                ("error_message", error_message.to_string()),
            ]),
            None,
        )
    }

    pub fn notify_system_maintenance(&self, user_id: &str, maintenance_date: &str) -> Option<Notification> {
        self.create_from_template(
            user_id,
            "system_maintenance",
            &vars([("maintenance_date", maintenance_date.to_string())]),
            None,
        )
    }
}
