use std::collections::HashMap;

use super::domain::{ApplicantGroup, ApplicationRecord, PHONE_NOT_PROVIDED};

/// Partition records by applicant email, keeping first-seen order.
///
/// Records without an email are dropped. The phone number of the first
/// record seen for an email is kept for the whole group.
pub fn group_by_email(records: Vec<ApplicationRecord>) -> Vec<ApplicantGroup> {
    let mut groups: Vec<ApplicantGroup> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for record in records {
        let email = match record.email.as_deref().map(str::trim) {
            Some(email) if !email.is_empty() => email.to_string(),
            _ => continue,
        };

        match index.get(&email) {
            Some(&position) => groups[position].records.push(record),
            None => {
                let phone_number = record
                    .phone_number
                    .clone()
                    .unwrap_or_else(|| PHONE_NOT_PROVIDED.to_string());
                index.insert(email.clone(), groups.len());
                groups.push(ApplicantGroup {
                    email,
                    phone_number,
                    records: vec![record],
                });
            }
        }
    }

    groups
}
