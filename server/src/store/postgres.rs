use async_trait::async_trait;
use chrono::Utc;
use sqlx::{
    postgres::{PgPoolOptions, PgRow},
    PgConnection, PgPool, Row,
};
use tracing::{debug, info};
use uuid::Uuid;

use super::{validate_body, ConversationStore, ViewerClaim};
use crate::{
    error::RelayError,
    types::{
        next_message_timestamp, now_iso, AppendOutcome, ChannelOrigin, Contact, Conversation,
        ConversationFilter, ConversationStatus, IdentityKey, Message, MessageDelivery,
        MessageStatus, NewConversation, NewMessage, PlatformLink, Viewer,
    },
};

const CONVERSATION_COLUMNS: &str = "id, session_id, user_id, contact_name, contact_phone, \
     contact_email, status, needs_response, unread_count, last_message_at, \
     last_customer_message_at, link_platform, link_channel_id, viewer_admin_id, \
     viewer_admin_name, viewer_since, viewer_heartbeat, deleted_at, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, body, from_customer, channel_origin, \
     external_ref, status, authored_by, created_at";

pub struct PgConversationStore {
    pool: PgPool,
}

impl PgConversationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, RelayError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<(), RelayError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn parse_conversation_row(row: &PgRow) -> Result<Conversation, RelayError> {
    let link = match (
        row.try_get::<Option<String>, _>("link_platform")?,
        row.try_get::<Option<String>, _>("link_channel_id")?,
    ) {
        (Some(platform), Some(channel_id)) => Some(PlatformLink {
            platform: platform.parse()?,
            channel_id,
        }),
        _ => None,
    };
    let viewer = match (
        row.try_get::<Option<String>, _>("viewer_admin_id")?,
        row.try_get::<Option<String>, _>("viewer_since")?,
        row.try_get::<Option<String>, _>("viewer_heartbeat")?,
    ) {
        (Some(admin_id), Some(viewing_since), Some(last_heartbeat)) => Some(Viewer {
            admin_id,
            admin_name: row.try_get("viewer_admin_name")?,
            viewing_since,
            last_heartbeat,
        }),
        _ => None,
    };

    Ok(Conversation {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        user_id: row.try_get("user_id")?,
        contact: Contact {
            name: row.try_get("contact_name")?,
            phone: row.try_get("contact_phone")?,
            email: row.try_get("contact_email")?,
        },
        status: row.try_get::<String, _>("status")?.parse()?,
        needs_response: row.try_get("needs_response")?,
        unread_count: row.try_get::<i32, _>("unread_count")?.max(0) as u32,
        last_message_at: row.try_get("last_message_at")?,
        last_customer_message_at: row.try_get("last_customer_message_at")?,
        link,
        viewer,
        deleted_at: row.try_get("deleted_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_message_row(row: &PgRow) -> Result<Message, RelayError> {
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        body: row.try_get("body")?,
        from_customer: row.try_get("from_customer")?,
        channel_origin: row.try_get::<String, _>("channel_origin")?.parse()?,
        external_ref: row.try_get("external_ref")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        authored_by: row.try_get("authored_by")?,
        created_at: row.try_get("created_at")?,
    })
}

async fn load_conversation(
    conn: &mut PgConnection,
    id: &str,
    for_update: bool,
) -> Result<Option<Conversation>, RelayError> {
    let sql = format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1{}",
        if for_update { " FOR UPDATE" } else { "" }
    );
    let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?;
    row.as_ref().map(parse_conversation_row).transpose()
}

async fn require_conversation(
    conn: &mut PgConnection,
    id: &str,
    for_update: bool,
) -> Result<Conversation, RelayError> {
    load_conversation(conn, id, for_update)
        .await?
        .ok_or_else(|| RelayError::not_found("conversation", id))
}

/// Ids of the merged history `anchor` belongs to, in id order. With
/// `for_update` the rows are locked in that order.
async fn family_ids(
    conn: &mut PgConnection,
    anchor: &Conversation,
    for_update: bool,
) -> Result<Vec<String>, RelayError> {
    let (filter, key) = match anchor.owner() {
        Some(IdentityKey::User(user_id)) => ("user_id = $2", user_id),
        Some(IdentityKey::Session(session_id)) => ("user_id IS NULL AND session_id = $2", session_id),
        None => return Ok(vec![anchor.id.clone()]),
    };
    let sql = format!(
        "SELECT id FROM conversations \
         WHERE id = $1 OR ({filter} AND deleted_at IS NULL) \
         ORDER BY id{}",
        if for_update { " FOR UPDATE" } else { "" }
    );
    let rows = sqlx::query(&sql)
        .bind(&anchor.id)
        .bind(key)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter()
        .map(|row| row.try_get::<String, _>("id").map_err(RelayError::from))
        .collect()
}

async fn lock_identity(conn: &mut PgConnection, key: &IdentityKey) -> Result<(), RelayError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(key.lock_key())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Trailing customer messages across the family. Equivalent to
/// `unread::derive` over the family history, computed in the database.
async fn recompute_unread(conn: &mut PgConnection, ids: &[String]) -> Result<(), RelayError> {
    let unread = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(1) FROM chat_messages \
         WHERE conversation_id = ANY($1::text[]) \
           AND from_customer \
           AND created_at > COALESCE( \
               (SELECT MAX(created_at) FROM chat_messages \
                WHERE conversation_id = ANY($1::text[]) AND NOT from_customer), '')",
    )
    .bind(ids)
    .fetch_one(&mut *conn)
    .await?;

    sqlx::query(
        "UPDATE conversations SET needs_response = $2, unread_count = $3 \
         WHERE id = ANY($1::text[])",
    )
    .bind(ids)
    .bind(unread > 0)
    .bind(unread.min(i32::MAX as i64) as i32)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn stored_message(
    conn: &mut PgConnection,
    channel: ChannelOrigin,
    external_ref: &str,
) -> Result<Option<Message>, RelayError> {
    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM chat_messages \
         WHERE channel_origin = $1 AND external_ref = $2 \
         ORDER BY created_at ASC LIMIT 1"
    );
    let row = sqlx::query(&sql)
        .bind(channel.as_str())
        .bind(external_ref)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(parse_message_row).transpose()
}

async fn duplicate_outcome(
    conn: &mut PgConnection,
    existing: Message,
) -> Result<AppendOutcome, RelayError> {
    let conversation = require_conversation(conn, &existing.conversation_id, false).await?;
    let family_ids = family_ids(conn, &conversation, false).await?;
    Ok(AppendOutcome {
        message: existing,
        conversation,
        family_ids,
        duplicate: true,
    })
}

async fn insert_conversation(
    conn: &mut PgConnection,
    new: NewConversation,
) -> Result<Conversation, RelayError> {
    let now = now_iso();
    let (session_id, user_id) = match new.owner {
        IdentityKey::Session(session_id) => (Some(session_id), None),
        IdentityKey::User(user_id) => (new.session_id, Some(user_id)),
    };
    let contact = new.contact.normalized();
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO conversations \
         (id, session_id, user_id, contact_name, contact_phone, contact_email, status, \
          needs_response, unread_count, link_platform, link_channel_id, created_at, updated_at) \
         VALUES ($1,$2,$3,$4,$5,$6,'open',FALSE,0,$7,$8,$9,$9)",
    )
    .bind(&id)
    .bind(&session_id)
    .bind(&user_id)
    .bind(&contact.name)
    .bind(&contact.phone)
    .bind(&contact.email)
    .bind(new.link.as_ref().map(|l| l.platform.as_str()))
    .bind(new.link.as_ref().map(|l| l.channel_id.as_str()))
    .bind(&now)
    .execute(&mut *conn)
    .await?;
    debug!(conversation_id = %id, "conversation created");
    require_conversation(conn, &id, false).await
}

async fn write_contact(
    conn: &mut PgConnection,
    id: &str,
    contact: &Contact,
) -> Result<(), RelayError> {
    sqlx::query(
        "UPDATE conversations SET contact_name = $2, contact_phone = $3, contact_email = $4, \
         updated_at = $5 WHERE id = $1",
    )
    .bind(id)
    .bind(&contact.name)
    .bind(&contact.phone)
    .bind(&contact.email)
    .bind(now_iso())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl ConversationStore for PgConversationStore {
    async fn create_conversation(&self, new: NewConversation) -> Result<Conversation, RelayError> {
        let mut conn = self.pool.acquire().await?;
        insert_conversation(&mut conn, new).await
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, RelayError> {
        let mut conn = self.pool.acquire().await?;
        load_conversation(&mut conn, id, false).await
    }

    async fn find_or_create_for_identity(
        &self,
        new: NewConversation,
    ) -> Result<(Conversation, bool), RelayError> {
        let mut tx = self.pool.begin().await?;
        lock_identity(&mut tx, &new.owner).await?;

        let (filter, key) = match &new.owner {
            IdentityKey::User(user_id) => ("user_id = $1", user_id.as_str()),
            IdentityKey::Session(session_id) => {
                ("user_id IS NULL AND session_id = $1", session_id.as_str())
            }
        };
        let sql = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE {filter} AND deleted_at IS NULL AND status <> 'closed' \
             ORDER BY COALESCE(last_message_at, created_at) DESC LIMIT 1"
        );
        let existing = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?
            .as_ref()
            .map(parse_conversation_row)
            .transpose()?;

        let result = match existing {
            Some(mut conversation) => {
                if conversation.contact.enrich(&new.contact) {
                    write_contact(&mut tx, &conversation.id, &conversation.contact).await?;
                }
                if conversation.link.is_none() {
                    if let Some(link) = &new.link {
                        sqlx::query(
                            "UPDATE conversations SET link_platform = $2, link_channel_id = $3 \
                             WHERE id = $1",
                        )
                        .bind(&conversation.id)
                        .bind(link.platform.as_str())
                        .bind(&link.channel_id)
                        .execute(&mut *tx)
                        .await?;
                    }
                }
                let conversation = require_conversation(&mut tx, &conversation.id, false).await?;
                (conversation, false)
            }
            None => (insert_conversation(&mut tx, new).await?, true),
        };
        tx.commit().await?;
        Ok(result)
    }

    async fn append_message(&self, new: NewMessage) -> Result<AppendOutcome, RelayError> {
        let body = validate_body(&new.body)?;
        let mut tx = self.pool.begin().await?;

        let anchor = require_conversation(&mut tx, &new.conversation_id, false).await?;
        if let Some(owner) = anchor.owner() {
            lock_identity(&mut tx, &owner).await?;
        }
        let anchor = require_conversation(&mut tx, &new.conversation_id, false).await?;
        family_ids(&mut tx, &anchor, true).await?;
        // Re-read under the row lock so last_message_at is current.
        let anchor = require_conversation(&mut tx, &new.conversation_id, false).await?;

        if let Some(external_ref) = new.external_ref.as_deref() {
            if let Some(existing) = stored_message(&mut tx, new.channel_origin, external_ref).await? {
                let outcome = duplicate_outcome(&mut tx, existing).await?;
                tx.commit().await?;
                return Ok(outcome);
            }
        }

        let created_at = next_message_timestamp(anchor.last_message_at.as_deref(), Utc::now());
        let message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: anchor.id.clone(),
            body,
            from_customer: new.from_customer,
            channel_origin: new.channel_origin,
            external_ref: new.external_ref,
            status: new.status,
            authored_by: new.authored_by,
            created_at: created_at.clone(),
        };

        // A redelivery racing into another family's lock trips the unique
        // index on platform refs instead of writing a second copy.
        let inserted = sqlx::query(
            "INSERT INTO chat_messages \
             (id, conversation_id, body, from_customer, channel_origin, external_ref, status, authored_by, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9) \
             ON CONFLICT DO NOTHING",
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(&message.body)
        .bind(message.from_customer)
        .bind(message.channel_origin.as_str())
        .bind(&message.external_ref)
        .bind(message.status.as_str())
        .bind(&message.authored_by)
        .bind(&message.created_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if inserted == 0 {
            let external_ref = message.external_ref.as_deref().unwrap_or_default();
            let existing = stored_message(&mut tx, message.channel_origin, external_ref)
                .await?
                .ok_or_else(|| RelayError::Internal(format!("message {} was not inserted", message.id)))?;
            let outcome = duplicate_outcome(&mut tx, existing).await?;
            tx.commit().await?;
            return Ok(outcome);
        }

        sqlx::query(
            "UPDATE conversations SET \
               last_message_at = $2, \
               last_customer_message_at = CASE WHEN $3 THEN $2 ELSE last_customer_message_at END, \
               status = 'open', \
               deleted_at = NULL, \
               updated_at = $2 \
             WHERE id = $1",
        )
        .bind(&anchor.id)
        .bind(&created_at)
        .bind(message.from_customer)
        .execute(&mut *tx)
        .await?;

        // A resurrected conversation rejoins its family.
        let anchor = require_conversation(&mut tx, &anchor.id, false).await?;
        let ids = family_ids(&mut tx, &anchor, true).await?;
        recompute_unread(&mut tx, &ids).await?;
        let conversation = require_conversation(&mut tx, &anchor.id, false).await?;
        tx.commit().await?;

        Ok(AppendOutcome {
            message,
            conversation,
            family_ids: ids,
            duplicate: false,
        })
    }

    async fn recompute_family(&self, conversation_id: &str) -> Result<Vec<String>, RelayError> {
        let mut tx = self.pool.begin().await?;
        let anchor = require_conversation(&mut tx, conversation_id, false).await?;
        if let Some(owner) = anchor.owner() {
            lock_identity(&mut tx, &owner).await?;
        }
        let anchor = require_conversation(&mut tx, conversation_id, false).await?;
        let ids = family_ids(&mut tx, &anchor, true).await?;
        recompute_unread(&mut tx, &ids).await?;
        tx.commit().await?;
        Ok(ids)
    }

    async fn list_conversations(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Vec<Conversation>, RelayError> {
        let sql = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations c \
             WHERE ($1 OR c.deleted_at IS NULL) \
               AND ($2::text IS NULL OR c.status = $2) \
               AND ($3::text IS NULL \
                    OR LOWER(c.id) = $3 \
                    OR LOWER(COALESCE(c.contact_name, '')) LIKE '%' || $3 || '%' \
                    OR LOWER(COALESCE(c.contact_email, '')) LIKE '%' || $3 || '%' \
                    OR LOWER(COALESCE(c.contact_phone, '')) LIKE '%' || $3 || '%' \
                    OR EXISTS (SELECT 1 FROM chat_messages m \
                               WHERE m.conversation_id = c.id \
                                 AND LOWER(m.body) LIKE '%' || $3 || '%')) \
             ORDER BY c.needs_response DESC, \
                      c.last_customer_message_at DESC NULLS LAST, \
                      c.last_message_at DESC NULLS LAST, \
                      c.created_at DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(filter.include_deleted)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.search_term())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(parse_conversation_row).collect()
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, RelayError> {
        let mut conn = self.pool.acquire().await?;
        let anchor = require_conversation(&mut conn, conversation_id, false).await?;
        let ids = family_ids(&mut conn, &anchor, false).await?;
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_messages \
             WHERE conversation_id = ANY($1::text[]) ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql).bind(&ids).fetch_all(&mut *conn).await?;
        rows.iter().map(parse_message_row).collect()
    }

    async fn family_ids(&self, conversation_id: &str) -> Result<Vec<String>, RelayError> {
        let mut conn = self.pool.acquire().await?;
        let anchor = require_conversation(&mut conn, conversation_id, false).await?;
        family_ids(&mut conn, &anchor, false).await
    }

    async fn update_status(
        &self,
        id: &str,
        status: ConversationStatus,
    ) -> Result<Conversation, RelayError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query(
            "UPDATE conversations SET status = $2, updated_at = $3 WHERE id = $1 AND status <> $2",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(now_iso())
        .execute(&mut *conn)
        .await?;
        require_conversation(&mut conn, id, false).await
    }

    async fn soft_delete(&self, id: &str) -> Result<Conversation, RelayError> {
        let mut conn = self.pool.acquire().await?;
        let now = now_iso();
        sqlx::query(
            "UPDATE conversations SET deleted_at = $2, updated_at = $2 \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(&now)
        .execute(&mut *conn)
        .await?;
        require_conversation(&mut conn, id, false).await
    }

    async fn update_contact(&self, id: &str, contact: &Contact) -> Result<Conversation, RelayError> {
        let mut tx = self.pool.begin().await?;
        let mut conversation = require_conversation(&mut tx, id, true).await?;
        if conversation.contact.enrich(contact) {
            write_contact(&mut tx, id, &conversation.contact).await?;
            conversation = require_conversation(&mut tx, id, false).await?;
        }
        tx.commit().await?;
        Ok(conversation)
    }

    async fn conversations_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<Conversation>, RelayError> {
        let sql = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE session_id = $1 ORDER BY created_at ASC"
        );
        let rows = sqlx::query(&sql).bind(session_id).fetch_all(&self.pool).await?;
        rows.iter().map(parse_conversation_row).collect()
    }

    async fn conversations_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<Conversation>, RelayError> {
        let sql = format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE user_id = $1 AND deleted_at IS NULL ORDER BY created_at ASC"
        );
        let rows = sqlx::query(&sql).bind(user_id).fetch_all(&self.pool).await?;
        rows.iter().map(parse_conversation_row).collect()
    }

    async fn assign_user(&self, id: &str, user_id: &str) -> Result<bool, RelayError> {
        let mut tx = self.pool.begin().await?;
        let conversation = require_conversation(&mut tx, id, true).await?;
        let outcome = match conversation.user_id.as_deref() {
            Some(existing) if existing == user_id => Ok(false),
            Some(existing) => Err(RelayError::MergeConflict {
                session_id: conversation.session_id.clone().unwrap_or_default(),
                existing_user_id: existing.to_string(),
                requested_user_id: user_id.to_string(),
            }),
            None => {
                sqlx::query("UPDATE conversations SET user_id = $2, updated_at = $3 WHERE id = $1")
                    .bind(id)
                    .bind(user_id)
                    .bind(now_iso())
                    .execute(&mut *tx)
                    .await?;
                Ok(true)
            }
        };
        tx.commit().await?;
        outcome
    }

    async fn find_message_by_external_ref(
        &self,
        channel: ChannelOrigin,
        external_ref: &str,
    ) -> Result<Option<Message>, RelayError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_messages \
             WHERE channel_origin = $1 AND external_ref = $2 \
             ORDER BY created_at DESC LIMIT 1"
        );
        if let Some(row) = sqlx::query(&sql)
            .bind(channel.as_str())
            .bind(external_ref)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(Some(parse_message_row(&row)?));
        }

        let row = sqlx::query(
            "SELECT m.id, m.conversation_id, m.body, m.from_customer, m.channel_origin, \
                    m.external_ref, m.status, m.authored_by, m.created_at \
             FROM message_deliveries d \
             JOIN chat_messages m ON m.id = d.message_id \
             WHERE d.channel = $1 AND d.external_ref = $2 \
             ORDER BY d.attempted_at DESC LIMIT 1",
        )
        .bind(channel.as_str())
        .bind(external_ref)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_message_row).transpose()
    }

    async fn find_stored_message(
        &self,
        channel: ChannelOrigin,
        external_ref: &str,
    ) -> Result<Option<Message>, RelayError> {
        let mut conn = self.pool.acquire().await?;
        stored_message(&mut conn, channel, external_ref).await
    }

    async fn recent_customer_messages(&self, limit: usize) -> Result<Vec<Message>, RelayError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_messages \
             WHERE from_customer ORDER BY created_at DESC LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(parse_message_row).collect()
    }

    async fn update_message_status(
        &self,
        message_id: &str,
        status: MessageStatus,
        external_ref: Option<&str>,
    ) -> Result<Message, RelayError> {
        let sql = format!(
            "UPDATE chat_messages SET \
               status = $2, \
               external_ref = CASE \
                 WHEN status IN ('queued', 'sent_to_platform') AND external_ref IS NULL THEN $3 \
                 ELSE external_ref END \
             WHERE id = $1 \
             RETURNING {MESSAGE_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(message_id)
            .bind(status.as_str())
            .bind(external_ref)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| RelayError::not_found("message", message_id))?;
        parse_message_row(&row)
    }

    async fn record_delivery(&self, delivery: &MessageDelivery) -> Result<(), RelayError> {
        sqlx::query(
            "INSERT INTO message_deliveries \
             (id, message_id, conversation_id, channel, recipient, role, external_ref, success, error, attempted_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&delivery.id)
        .bind(&delivery.message_id)
        .bind(&delivery.conversation_id)
        .bind(delivery.channel.as_str())
        .bind(&delivery.recipient)
        .bind(delivery.role.as_str())
        .bind(&delivery.external_ref)
        .bind(delivery.success)
        .bind(&delivery.error)
        .bind(&delivery.attempted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_queued(
        &self,
        stale_before: &str,
        now: &str,
        limit: usize,
    ) -> Result<Vec<Message>, RelayError> {
        let sql = format!(
            "UPDATE chat_messages SET claimed_at = $2 \
             WHERE id IN ( \
                 SELECT id FROM chat_messages \
                 WHERE status = 'queued' AND COALESCE(claimed_at, created_at) < $1 \
                 ORDER BY created_at ASC LIMIT $3 \
                 FOR UPDATE SKIP LOCKED) \
             RETURNING {MESSAGE_COLUMNS}"
        );
        let rows = sqlx::query(&sql)
            .bind(stale_before)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        let mut claimed = rows
            .iter()
            .map(parse_message_row)
            .collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        if !claimed.is_empty() {
            debug!(claimed = claimed.len(), "queued messages claimed for retry");
        }
        Ok(claimed)
    }

    async fn claim_viewer(
        &self,
        id: &str,
        claim: &ViewerClaim,
    ) -> Result<Option<Viewer>, RelayError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query(
            "UPDATE conversations SET \
               viewer_since = CASE WHEN viewer_admin_id = $2 THEN viewer_since ELSE $4 END, \
               viewer_admin_id = $2, \
               viewer_admin_name = $3, \
               viewer_heartbeat = $4 \
             WHERE id = $1 \
               AND (viewer_admin_id IS NULL OR viewer_admin_id = $2 OR viewer_heartbeat < $5)",
        )
        .bind(id)
        .bind(&claim.admin_id)
        .bind(&claim.admin_name)
        .bind(&claim.now)
        .bind(&claim.stale_before)
        .execute(&mut *conn)
        .await?;
        Ok(require_conversation(&mut conn, id, false).await?.viewer)
    }

    async fn release_viewer(&self, id: &str, admin_id: &str) -> Result<bool, RelayError> {
        let mut conn = self.pool.acquire().await?;
        let released = sqlx::query(
            "UPDATE conversations SET viewer_admin_id = NULL, viewer_admin_name = NULL, \
             viewer_since = NULL, viewer_heartbeat = NULL \
             WHERE id = $1 AND viewer_admin_id = $2",
        )
        .bind(id)
        .bind(admin_id)
        .execute(&mut *conn)
        .await?
        .rows_affected()
            > 0;
        if !released {
            require_conversation(&mut conn, id, false).await?;
        }
        Ok(released)
    }
}
