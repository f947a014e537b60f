use chrono::{DateTime, Utc};
use parley_types::models::Profile;
use rusqlite::params_from_iter;
use uuid::Uuid;

use crate::models::parse_uuid;
use crate::{Database, DbError, placeholders};

impl Database {
    pub fn upsert_profile(&self, profile: &Profile, now: DateTime<Utc>) -> Result<(), DbError> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO profiles (user_id, name, avatar_url, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id) DO UPDATE SET
                     name = excluded.name,
                     avatar_url = excluded.avatar_url,
                     updated_at = excluded.updated_at",
                rusqlite::params![
                    profile.user_id.to_string(),
                    profile.name,
                    profile.avatar_url,
                    now.timestamp_millis()
                ],
            )?;
            Ok(())
        })
    }

    /// Batch-fetch profiles. Unknown ids are simply missing from the result.
    pub fn get_profiles(&self, user_ids: &[Uuid]) -> Result<Vec<Profile>, DbError> {
        if user_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT user_id, name, avatar_url FROM profiles WHERE user_id IN ({})",
                placeholders(1, user_ids.len())
            );
            let params: Vec<String> = user_ids.iter().map(Uuid::to_string).collect();

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(params.iter()), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(id, name, avatar_url)| {
                    Ok(Profile {
                        user_id: parse_uuid(&id, &id)?,
                        name,
                        avatar_url,
                    })
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_then_batch_lookup() {
        let db = Database::open_in_memory().unwrap();
        let alice = Profile {
            user_id: Uuid::new_v4(),
            name: "alice".into(),
            avatar_url: None,
        };
        db.upsert_profile(&alice, Utc::now()).unwrap();
        db.upsert_profile(
            &Profile {
                avatar_url: Some("https://cdn.example/alice.png".into()),
                ..alice.clone()
            },
            Utc::now(),
        )
        .unwrap();

        let found = db.get_profiles(&[alice.user_id, Uuid::new_v4()]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].avatar_url.as_deref(), Some("https://cdn.example/alice.png"));
    }
}
