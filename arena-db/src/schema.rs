//! Diesel table definitions for the pooled (PostgreSQL) backend. Mirrors
//! `arena-db/migrations/*.sql` field-for-field, the way the teacher crate
//! keeps `mmoldb-db/src/schema/data_schema.rs` hand-written alongside its SQL
//! migrations rather than generated at build time.

diesel::table! {
    players (player_id) {
        player_id -> Text,
        model_name -> Text,
        model_provider -> Text,
    }
}

diesel::table! {
    games (game_id) {
        game_id -> Text,
        tournament_id -> Nullable<Text>,
        start_time -> Timestamptz,
        end_time -> Nullable<Timestamptz>,
        black_player_id -> Text,
        black_player_json -> Jsonb,
        white_player_id -> Text,
        white_player_json -> Jsonb,
        initial_fen -> Text,
        final_fen -> Nullable<Text>,
        outcome_result -> Nullable<Text>,
        outcome_winner -> Nullable<SmallInt>,
        outcome_termination -> Nullable<Text>,
        total_moves -> Integer,
        duration_seconds -> Nullable<Double>,
        metadata -> Jsonb,
    }
}

diesel::table! {
    moves (id) {
        id -> BigInt,
        game_id -> Text,
        move_number -> Integer,
        player -> SmallInt,
        timestamp -> Timestamptz,
        fen_before -> Text,
        fen_after -> Text,
        legal_moves -> Jsonb,
        move_san -> Text,
        move_uci -> Text,
        is_legal -> Bool,
        prompt_text -> Text,
        raw_response -> Text,
        parsed_move -> Nullable<Text>,
        parsing_success -> Bool,
        parsing_attempts -> Integer,
        thinking_time_ms -> BigInt,
        api_call_time_ms -> BigInt,
        parsing_time_ms -> BigInt,
        move_quality_score -> Nullable<Double>,
        blunder_flag -> Bool,
        error_kind -> Nullable<Text>,
        error_message -> Nullable<Text>,
    }
}

diesel::table! {
    rethink_attempts (id) {
        id -> BigInt,
        move_id -> BigInt,
        attempt_number -> Integer,
        prompt_text -> Text,
        raw_response -> Text,
        parsed_move -> Nullable<Text>,
        was_legal -> Bool,
        timestamp -> Timestamptz,
    }
}

diesel::table! {
    player_stats (player_id) {
        player_id -> Text,
        games_played -> Integer,
        wins -> Integer,
        losses -> Integer,
        draws -> Integer,
        illegal_move_rate -> Double,
        average_thinking_time_ms -> Double,
        elo_rating -> Double,
        last_updated -> Timestamptz,
    }
}

diesel::table! {
    schema_migrations (version) {
        version -> BigInt,
        name -> Text,
        applied_at -> Timestamptz,
    }
}

diesel::joinable!(moves -> games (game_id));
diesel::joinable!(rethink_attempts -> moves (move_id));
diesel::allow_tables_to_appear_in_same_query!(games, moves, rethink_attempts, player_stats, players);
