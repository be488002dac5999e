// SQLite schema for the measurement store

pub(crate) const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS meta (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  tcpts_mean REAL,
  tcpts_stddev REAL,
  tcpts_slopes TEXT,
  unusual_case TEXT,
  greater INTEGER
);

CREATE TABLE IF NOT EXISTS probes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  sample INTEGER NOT NULL,
  test_case TEXT NOT NULL,
  type TEXT NOT NULL CHECK (type IN ('train', 'train_null', 'test')),
  tc_order INTEGER NOT NULL,
  time_of_day INTEGER NOT NULL,
  local_port INTEGER NOT NULL,
  reported INTEGER NOT NULL,
  userspace_rtt INTEGER NOT NULL,
  UNIQUE (sample, test_case)
);

CREATE TABLE IF NOT EXISTS packets (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  probe_id INTEGER REFERENCES probes(id) ON DELETE CASCADE,
  sent INTEGER NOT NULL CHECK (sent IN (0, 1)),
  observed INTEGER NOT NULL,
  tsval INTEGER NOT NULL,
  payload_len INTEGER NOT NULL,
  tcpseq INTEGER NOT NULL,
  tcpack INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS analysis (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  probe_id INTEGER NOT NULL UNIQUE REFERENCES probes(id) ON DELETE CASCADE,
  suspect TEXT,
  packet_rtt INTEGER NOT NULL,
  tsval_rtt INTEGER
);

CREATE TABLE IF NOT EXISTS trim_analysis (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  probe_id INTEGER NOT NULL REFERENCES probes(id) ON DELETE CASCADE,
  suspect TEXT,
  packet_rtt INTEGER NOT NULL,
  tsval_rtt INTEGER,
  sent_trimmed INTEGER NOT NULL,
  rcvd_trimmed INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS classifier_results (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  classifier TEXT NOT NULL,
  trial_type TEXT NOT NULL,
  num_observations INTEGER NOT NULL,
  num_trials INTEGER NOT NULL,
  params TEXT NOT NULL,
  false_positives REAL NOT NULL,
  false_negatives REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS probes_port ON probes (local_port);
CREATE INDEX IF NOT EXISTS packets_probe ON packets (probe_id);
CREATE INDEX IF NOT EXISTS trim_analysis_setting
  ON trim_analysis (sent_trimmed, rcvd_trimmed, probe_id);
CREATE INDEX IF NOT EXISTS classifier_results_lookup
  ON classifier_results (classifier, trial_type, num_observations);
";
