//! Game persistence: append-only `games` / `moves` tables plus the FEN log
//! file for the web viewer.
//!
//! A takeback removes the newest `moves` row for the game. Failures are
//! logged and never interrupt play.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::settings::GameInfoSettings;

#[derive(Debug, Clone)]
pub struct GameRecord {
    pub id: i64,
    pub created_at: String,
    pub source_file: String,
    pub event: String,
    pub site: String,
    pub round: String,
    pub white: String,
    pub black: String,
    pub result: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MoveRecord {
    pub id: i64,
    pub game_id: i64,
    pub move_uci: String,
    pub fen_after: String,
    pub white_clock_s: Option<i64>,
    pub black_clock_s: Option<i64>,
    pub eval_centipawns: Option<i64>,
}

#[derive(Clone)]
pub struct GameStore {
    pool: SqlitePool,
}

impl GameStore {
    /// Open (or create) the database and its tables.
    pub async fn open(path: &str) -> Result<GameStore> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        // A single connection keeps writes ordered and makes `:memory:`
        // databases behave (each sqlite connection would get its own).
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("opening database {path}"))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS games (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                source_file TEXT NOT NULL DEFAULT '',
                event TEXT NOT NULL DEFAULT '',
                site TEXT NOT NULL DEFAULT '',
                round TEXT NOT NULL DEFAULT '',
                white TEXT NOT NULL DEFAULT '',
                black TEXT NOT NULL DEFAULT '',
                result TEXT
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS moves (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                game_id INTEGER NOT NULL REFERENCES games(id),
                move_uci TEXT NOT NULL,
                fen_after TEXT NOT NULL,
                white_clock_s INTEGER,
                black_clock_s INTEGER,
                eval_centipawns INTEGER
            )",
        )
        .execute(&pool)
        .await?;

        info!("Persistence: database ready at {path}");
        Ok(GameStore { pool })
    }

    /// Create the game record plus the initial-position row. Returns the
    /// new game id.
    pub async fn create_game(
        &self,
        info: &GameInfoSettings,
        source_file: &str,
        initial_fen: &str,
    ) -> Result<i64> {
        let created_at = Utc::now().to_rfc3339();
        let id = sqlx::query(
            "INSERT INTO games (created_at, source_file, event, site, round, white, black)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&created_at)
        .bind(source_file)
        .bind(&info.event)
        .bind(&info.site)
        .bind(&info.round)
        .bind(&info.white)
        .bind(&info.black)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        // Initial position row carries no move and no clocks.
        sqlx::query("INSERT INTO moves (game_id, move_uci, fen_after) VALUES (?, '', ?)")
            .bind(id)
            .bind(initial_fen)
            .execute(&self.pool)
            .await?;

        info!("Persistence: new game id={id}");
        Ok(id)
    }

    pub async fn record_move(
        &self,
        game_id: i64,
        move_uci: &str,
        fen_after: &str,
        white_clock_s: Option<i64>,
        black_clock_s: Option<i64>,
        eval_centipawns: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO moves (game_id, move_uci, fen_after, white_clock_s, black_clock_s, eval_centipawns)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(game_id)
        .bind(move_uci)
        .bind(fen_after)
        .bind(white_clock_s)
        .bind(black_clock_s)
        .bind(eval_centipawns)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Takeback: delete the newest move row for the game. Initial-position
    /// rows (empty `move_uci`) are left alone.
    pub async fn remove_last_move(&self, game_id: i64) -> Result<()> {
        sqlx::query(
            "DELETE FROM moves WHERE id = (
                SELECT id FROM moves
                WHERE game_id = ? AND move_uci != ''
                ORDER BY id DESC LIMIT 1
            )",
        )
        .bind(game_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_result(&self, game_id: i64, result: &str) -> Result<()> {
        sqlx::query("UPDATE games SET result = ? WHERE id = ?")
            .bind(result)
            .bind(game_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn moves_for_game(&self, game_id: i64) -> Result<Vec<MoveRecord>> {
        let rows = sqlx::query(
            "SELECT id, game_id, move_uci, fen_after, white_clock_s, black_clock_s, eval_centipawns
             FROM moves WHERE game_id = ? ORDER BY id",
        )
        .bind(game_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| MoveRecord {
                id: row.get(0),
                game_id: row.get(1),
                move_uci: row.get(2),
                fen_after: row.get(3),
                white_clock_s: row.get(4),
                black_clock_s: row.get(5),
                eval_centipawns: row.get(6),
            })
            .collect())
    }

    pub async fn latest_game_id(&self) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT MAX(id) FROM games")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get(0))
    }

    pub async fn game(&self, game_id: i64) -> Result<Option<GameRecord>> {
        let row = sqlx::query(
            "SELECT id, created_at, source_file, event, site, round, white, black, result
             FROM games WHERE id = ?",
        )
        .bind(game_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| GameRecord {
            id: row.get(0),
            created_at: row.get(1),
            source_file: row.get(2),
            event: row.get(3),
            site: row.get(4),
            round: row.get(5),
            white: row.get(6),
            black: row.get(7),
            result: row.get(8),
        }))
    }
}

/// Keeps one file current with the latest FEN for the web viewer.
#[derive(Clone)]
pub struct FenLog {
    path: String,
}

impl FenLog {
    pub fn new(path: &str) -> FenLog {
        FenLog {
            path: path.to_string(),
        }
    }

    pub async fn write(&self, fen: &str) {
        if let Err(e) = tokio::fs::write(&self.path, format!("{fen}\n")).await {
            warn!("FEN log: write failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> GameStore {
        GameStore::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn create_records_initial_row() {
        let store = memory_store().await;
        let info = GameInfoSettings::default();
        let id = store.create_game(&info, "board", "startfen").await.unwrap();
        let moves = store.moves_for_game(id).await.unwrap();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].move_uci, "");
        assert_eq!(moves[0].fen_after, "startfen");
    }

    #[tokio::test]
    async fn takeback_removes_only_the_newest_move() {
        let store = memory_store().await;
        let info = GameInfoSettings::default();
        let id = store.create_game(&info, "board", "start").await.unwrap();
        store
            .record_move(id, "e2e4", "fen1", Some(300), Some(300), Some(20))
            .await
            .unwrap();
        store
            .record_move(id, "e7e5", "fen2", Some(298), Some(299), Some(15))
            .await
            .unwrap();

        store.remove_last_move(id).await.unwrap();
        let moves = store.moves_for_game(id).await.unwrap();
        assert_eq!(moves.len(), 2);
        assert_eq!(moves.last().unwrap().move_uci, "e2e4");

        // Removing past the last real move leaves the initial row.
        store.remove_last_move(id).await.unwrap();
        store.remove_last_move(id).await.unwrap();
        let moves = store.moves_for_game(id).await.unwrap();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].move_uci, "");
    }

    #[tokio::test]
    async fn result_is_stored_on_the_game_row() {
        let store = memory_store().await;
        let info = GameInfoSettings::default();
        let id = store.create_game(&info, "board", "start").await.unwrap();
        store.set_result(id, "1-0").await.unwrap();
        let game = store.game(id).await.unwrap().unwrap();
        assert_eq!(game.result.as_deref(), Some("1-0"));
        assert_eq!(game.white, "White");
    }
}
