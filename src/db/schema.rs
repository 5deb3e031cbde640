pub const SCHEMA: &str = r#"
-- Person registry: curated identities the matcher resolves against
CREATE TABLE IF NOT EXISTS persons (
    person_id INTEGER PRIMARY KEY AUTOINCREMENT,
    display_name TEXT NOT NULL,
    output_folder_rel TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- Bounded embedding sets per person (reference seeds + learned)
CREATE TABLE IF NOT EXISTS person_embeddings (
    embedding_id INTEGER PRIMARY KEY AUTOINCREMENT,
    person_id INTEGER NOT NULL,
    embedding BLOB NOT NULL,          -- 512 x f32, little-endian, unit norm
    source_type TEXT NOT NULL CHECK (source_type IN ('reference', 'learned')),
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (person_id) REFERENCES persons(person_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_person_embeddings_person ON person_embeddings(person_id);

-- Derived matching targets: unit-norm mean of current embeddings
CREATE TABLE IF NOT EXISTS person_centroids (
    person_id INTEGER PRIMARY KEY,
    centroid BLOB NOT NULL,
    embedding_count INTEGER NOT NULL,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (person_id) REFERENCES persons(person_id) ON DELETE CASCADE
);

-- Singleton job configuration written by the control plane
CREATE TABLE IF NOT EXISTS job_config (
    config_id INTEGER PRIMARY KEY CHECK (config_id = 1),
    source_root TEXT,
    output_root TEXT,
    selected_person_ids TEXT,         -- JSON array, NULL = all persons
    group_mode INTEGER NOT NULL DEFAULT 0,
    group_folder_name TEXT,
    control TEXT NOT NULL DEFAULT 'run',  -- 'run', 'stop', 'terminate'
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

INSERT OR IGNORE INTO job_config (config_id) VALUES (1);

-- Jobs: one sorting run over a source tree
CREATE TABLE IF NOT EXISTS jobs (
    job_id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_root TEXT NOT NULL,
    output_root TEXT NOT NULL,
    total_images INTEGER NOT NULL DEFAULT 0,
    processed_images INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'created',  -- created/running/completed/stopped/failed
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    started_at TEXT,
    completed_at TEXT
);

-- Discovered image inventory, ordered deterministically
CREATE TABLE IF NOT EXISTS images (
    image_id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER NOT NULL,
    source_path TEXT NOT NULL,
    filename TEXT NOT NULL,
    extension TEXT NOT NULL,
    sha256 TEXT NOT NULL,
    ordering_idx INTEGER NOT NULL,
    UNIQUE (job_id, source_path),
    FOREIGN KEY (job_id) REFERENCES jobs(job_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_images_job_order ON images(job_id, ordering_idx);

-- Atomic batches: contiguous index ranges over the inventory
CREATE TABLE IF NOT EXISTS batches (
    batch_id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER NOT NULL,
    start_idx INTEGER NOT NULL,
    end_idx INTEGER NOT NULL,
    state TEXT NOT NULL DEFAULT 'PENDING',  -- PENDING/PROCESSING/COMMITTING/COMMITTED
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    started_at TEXT,
    committed_at TEXT,
    FOREIGN KEY (job_id) REFERENCES jobs(job_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_batches_job_state ON batches(job_id, state);

-- Per-image analysis outcome, written during PROCESSING
CREATE TABLE IF NOT EXISTS image_results (
    image_id INTEGER PRIMARY KEY,
    batch_id INTEGER NOT NULL,
    face_count INTEGER NOT NULL,
    matched_count INTEGER NOT NULL,
    unknown_count INTEGER NOT NULL,
    matched_person_ids TEXT NOT NULL,  -- JSON array of person ids
    processed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (image_id) REFERENCES images(image_id) ON DELETE CASCADE,
    FOREIGN KEY (batch_id) REFERENCES batches(batch_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_image_results_batch ON image_results(batch_id);

-- Two-phase commit ledger for output writes.
-- person_id is NULL for the single group-folder row of an image.
CREATE TABLE IF NOT EXISTS commit_log (
    commit_id INTEGER PRIMARY KEY AUTOINCREMENT,
    batch_id INTEGER NOT NULL,
    image_id INTEGER NOT NULL,
    person_id INTEGER,
    target_folder TEXT NOT NULL,
    output_filename TEXT NOT NULL,
    output_path TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',  -- pending/written/verified/failed
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    verified_at TEXT,
    UNIQUE (image_id, person_id),
    FOREIGN KEY (batch_id) REFERENCES batches(batch_id) ON DELETE CASCADE,
    FOREIGN KEY (image_id) REFERENCES images(image_id) ON DELETE CASCADE,
    FOREIGN KEY (person_id) REFERENCES persons(person_id)
);

-- At most one group row (NULL person) per image
CREATE UNIQUE INDEX IF NOT EXISTS idx_commit_log_group
    ON commit_log(image_id) WHERE person_id IS NULL;

CREATE INDEX IF NOT EXISTS idx_commit_log_batch ON commit_log(batch_id);
CREATE INDEX IF NOT EXISTS idx_commit_log_person ON commit_log(person_id);
"#;
