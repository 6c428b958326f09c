//! Identity resolution: mapping (data source, user id) to a stable
//! person.

use rusqlite::{params, OptionalExtension as _};

use crate::error::Result;
use crate::store::Archive;

/// A person in the archive, possibly known under several identities
/// across data sources.
#[derive(Debug, Clone)]
pub struct Person {
    pub id: i64,
    pub name: Option<String>,
    pub identities: Vec<PersonIdentity>,
}

/// One identity a person takes on at a data source.
#[derive(Debug, Clone)]
pub struct PersonIdentity {
    pub id: i64,
    pub person_id: i64,
    pub data_source_id: String,
    pub user_id: String,
}

impl Archive {
    /// The person mapped to `user_id` on the given data source, created
    /// (with `name` and a new identity row) on first sight. Lookup and
    /// creation run in one transaction so interleaved callers cannot
    /// mint two persons for the same identity.
    pub fn get_person(&self, data_source_id: &str, user_id: &str, name: &str) -> Result<Person> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let found: Option<(i64, Option<String>)> = tx
            .query_row(
                "SELECT persons.id, persons.name
                 FROM persons, person_identities
                 WHERE person_identities.data_source_id = ?1
                   AND person_identities.user_id = ?2
                   AND persons.id = person_identities.person_id
                 LIMIT 1",
                params![data_source_id, user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (person_id, person_name) = match found {
            Some(existing) => existing,
            None => {
                tx.execute("INSERT INTO persons (name) VALUES (?1)", params![name])?;
                let person_id = tx.last_insert_rowid();
                tx.execute(
                    "INSERT INTO person_identities (person_id, data_source_id, user_id)
                     VALUES (?1, ?2, ?3)",
                    params![person_id, data_source_id, user_id],
                )?;
                (person_id, Some(name.to_string()))
            }
        };

        let identities = {
            let mut stmt = tx.prepare(
                "SELECT id, person_id, data_source_id, user_id
                 FROM person_identities WHERE person_id = ?1",
            )?;
            let rows = stmt
                .query_map(params![person_id], |row| {
                    Ok(PersonIdentity {
                        id: row.get(0)?,
                        person_id: row.get(1)?,
                        data_source_id: row.get(2)?,
                        user_id: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        tx.commit()?;

        Ok(Person {
            id: person_id,
            name: person_name,
            identities,
        })
    }

    /// Link an existing person to another identity, so several service
    /// accounts resolve to the same person.
    pub fn add_person_identity(
        &self,
        person_id: i64,
        data_source_id: &str,
        user_id: &str,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO person_identities (person_id, data_source_id, user_id)
             VALUES (?1, ?2, ?3)
             ON CONFLICT DO NOTHING",
            params![person_id, data_source_id, user_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source;
    use tempfile::TempDir;

    fn archive() -> (std::sync::Arc<Archive>, TempDir) {
        let tmp = TempDir::new().unwrap();
        source::testutil::register_stub("ident_svc");
        source::testutil::register_stub("ident_svc2");
        let archive = Archive::open(tmp.path()).unwrap();
        archive.conn().execute_batch(
            "INSERT INTO data_sources (id, name) VALUES ('ident_svc', 'x') ON CONFLICT DO NOTHING;
             INSERT INTO data_sources (id, name) VALUES ('ident_svc2', 'y') ON CONFLICT DO NOTHING;",
        ).unwrap();
        (archive, tmp)
    }

    #[test]
    fn test_get_person_creates_on_first_sight() {
        let (archive, _tmp) = archive();

        let p = archive.get_person("ident_svc", "u1", "User One").unwrap();
        assert_eq!(p.name.as_deref(), Some("User One"));
        assert_eq!(p.identities.len(), 1);
        assert_eq!(p.identities[0].user_id, "u1");
    }

    #[test]
    fn test_get_person_returns_same_person() {
        let (archive, _tmp) = archive();

        let first = archive.get_person("ident_svc", "u1", "User One").unwrap();
        // The stored name wins on later sightings.
        let second = archive.get_person("ident_svc", "u1", "Renamed").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.name.as_deref(), Some("User One"));
    }

    #[test]
    fn test_identities_can_share_a_person() {
        let (archive, _tmp) = archive();

        let p = archive.get_person("ident_svc", "u1", "User One").unwrap();
        archive.add_person_identity(p.id, "ident_svc2", "other-u1").unwrap();

        let same = archive.get_person("ident_svc2", "other-u1", "ignored").unwrap();
        assert_eq!(same.id, p.id);
        assert_eq!(same.identities.len(), 2);
    }

    #[test]
    fn test_distinct_users_get_distinct_persons() {
        let (archive, _tmp) = archive();

        let a = archive.get_person("ident_svc", "u1", "A").unwrap();
        let b = archive.get_person("ident_svc", "u2", "B").unwrap();
        assert_ne!(a.id, b.id);
    }
}
