/// Schema shared by file-backed and in-memory databases.
pub(crate) const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS session_locks (
    phone TEXT NOT NULL,
    device TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    PRIMARY KEY (phone, device)
);

CREATE TABLE IF NOT EXISTS executions (
    execution_id TEXT PRIMARY KEY,
    flow_id TEXT NOT NULL,
    phone TEXT NOT NULL,
    device TEXT NOT NULL,
    current_node_id TEXT NOT NULL,
    last_node_id TEXT,
    waiting_for_reply INTEGER NOT NULL DEFAULT 0,
    stage TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    variables TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_executions_one_active
    ON executions(phone, device, flow_id) WHERE status = 'active';

CREATE INDEX IF NOT EXISTS idx_executions_conversation
    ON executions(phone, device, updated_at DESC);

CREATE TABLE IF NOT EXISTS conversation_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    phone TEXT NOT NULL,
    device TEXT NOT NULL,
    user_text TEXT NOT NULL,
    bot_text TEXT NOT NULL,
    stage TEXT,
    display_name TEXT,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_history_conversation
    ON conversation_history(phone, device, id);

CREATE TABLE IF NOT EXISTS field_captures (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device TEXT NOT NULL,
    stage TEXT NOT NULL COLLATE NOCASE,
    input_kind TEXT NOT NULL,
    fixed_value TEXT,
    target_field TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_field_captures_lookup
    ON field_captures(device, stage);
";
