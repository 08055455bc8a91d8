diesel::table! {
    task_records (task_id) {
        task_id -> Text,
        file_fingerprint -> Text,
        file_name -> Text,
        file_size -> BigInt,
        chunk_size -> BigInt,
        upload_token -> Nullable<Text>,
        token_expires_at -> Nullable<BigInt>,
        completed_chunks -> Text,
        whole_file_hash -> Nullable<Text>,
        status -> Text,
        created_at -> BigInt,
        updated_at -> BigInt,
    }
}
