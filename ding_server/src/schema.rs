//! Diesel table definitions.
//!
//! Tables: repos, builds, results, steps, settings, schema_version.
//! List-valued columns (emails, run prefix, environment) hold JSON text.

diesel::table! {
    repos (name) {
        name -> Text,
        vcs -> Text,
        origin -> Text,
        default_branch -> Text,
        checkout_path -> Text,
        build_script -> Text,
        uid -> Nullable<BigInt>,
        home_disk_usage -> BigInt,
        webhook_secret -> Text,
        allow_global_webhook_secrets -> Bool,
        bubblewrap -> Bool,
        bubblewrap_no_net -> Bool,
        build_on_updated_toolchain -> Bool,
        notify_emails -> Text,
    }
}

diesel::table! {
    builds (id) {
        id -> BigInt,
        repo_name -> Text,
        branch -> Text,
        commit_hash -> Text,
        status -> Text,
        low_prio -> Bool,
        build_script -> Text,
        created -> TimestamptzSqlite,
        start -> Nullable<TimestamptzSqlite>,
        finish -> Nullable<TimestamptzSqlite>,
        released -> Nullable<TimestamptzSqlite>,
        disk_usage -> BigInt,
        home_disk_usage_delta -> BigInt,
        error_message -> Text,
        version -> Text,
        coverage -> Nullable<Float>,
        coverage_report_file -> Text,
        builddir_removed -> Bool,
        last_line -> Text,
    }
}

diesel::table! {
    results (id) {
        id -> BigInt,
        build_id -> BigInt,
        command -> Text,
        os -> Text,
        arch -> Text,
        toolchain -> Text,
        filename -> Text,
        filesize -> BigInt,
    }
}

diesel::table! {
    steps (id) {
        id -> BigInt,
        build_id -> BigInt,
        name -> Text,
        output -> Text,
        nsec -> BigInt,
    }
}

diesel::table! {
    settings (id) {
        id -> Integer,
        notify_emails -> Text,
        github_webhook_secret -> Text,
        gitea_webhook_secret -> Text,
        bitbucket_webhook_secret -> Text,
        gotoolchain_webhook_secret -> Text,
        run_prefix -> Text,
        environment -> Text,
        auto_go_toolchain -> Bool,
    }
}

diesel::table! {
    schema_version (id) {
        id -> Integer,
        version -> Integer,
    }
}

diesel::joinable!(builds -> repos (repo_name));
diesel::joinable!(results -> builds (build_id));
diesel::joinable!(steps -> builds (build_id));

diesel::allow_tables_to_appear_in_same_query!(repos, builds, results, steps, settings);
