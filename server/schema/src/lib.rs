#![deny(warnings)]

pub static DDL_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS documents (
       collection  TEXT NOT NULL,
       id          TEXT NOT NULL,
       fields      TEXT NOT NULL,

       PRIMARY KEY (collection, id)
     )",
    "CREATE INDEX IF NOT EXISTS documents_content_key
       ON documents (collection, json_extract(fields, '$.content_key'))",
];
