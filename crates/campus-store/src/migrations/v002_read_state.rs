use rusqlite::Connection;

const UP_SQL: &str = r#"
-- Read receipts (nullable is_read on purpose: legacy rows carry NULL)
ALTER TABLE messages ADD COLUMN is_read INTEGER;
ALTER TABLE messages ADD COLUMN read_at TEXT;

-- Per-side soft deletion
ALTER TABLE messages ADD COLUMN deleted_by_sender INTEGER NOT NULL DEFAULT 0;
ALTER TABLE messages ADD COLUMN deleted_by_receiver INTEGER NOT NULL DEFAULT 0;

-- Client correlation id echoed back to the sender
ALTER TABLE messages ADD COLUMN client_id TEXT;

CREATE INDEX IF NOT EXISTS idx_messages_receiver_unread
    ON messages(receiver_id, is_read);
CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_client_id
    ON messages(sender_id, client_id) WHERE client_id IS NOT NULL;
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
