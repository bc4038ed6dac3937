//! Read-only user queries. Users themselves are owned by the (out-of-scope)
//! CRUD surface; this store only ever selects.

use async_trait::async_trait;
use chrono::{Datelike, Duration, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use sqlx::PgPool;

use crate::common::UserId;
use crate::domain::timezone::is_leap_year;

use super::model::User;

/// The UTC ±1 day over-selection window as (month, day) pairs, plus whether
/// the window crosses a Feb 28 that is a non-leap-year stand-in for Feb 29
/// (so Feb 29 birthdays are still pre-selected when their fallback day is in
/// range). Built from real calendar dates so a window spanning a month or
/// year boundary (Jan 31 -> Feb 1, Dec 31 -> Jan 1) is handled without any
/// special-casing.
struct NearTodayWindow {
    yesterday: (i32, i32),
    today: (i32, i32),
    tomorrow: (i32, i32),
    feb_29_fallback_active: bool,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, id: UserId) -> anyhow::Result<Option<User>>;

    /// Users whose stored birthday month/day matches today in UTC, over-
    /// selected by a +/-1 day window so every timezone's "today" is covered;
    /// callers filter per-user by zone with `is_anniversary_today`.
    fn users_with_birthday_near_today(&self) -> BoxStream<'_, anyhow::Result<User>>;

    fn users_with_anniversary_near_today(&self) -> BoxStream<'_, anyhow::Result<User>>;
}

pub struct PostgresUserStore {
    pool: PgPool,
}

impl PostgresUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn near_today_window() -> NearTodayWindow {
        let today = Utc::now().date_naive();
        let yesterday = today - Duration::days(1);
        let tomorrow = today + Duration::days(1);
        let feb_29_fallback_active = [yesterday, today, tomorrow]
            .iter()
            .any(|d| d.month() == 2 && d.day() == 28 && !is_leap_year(d.year()));

        NearTodayWindow {
            yesterday: (yesterday.month() as i32, yesterday.day() as i32),
            today: (today.month() as i32, today.day() as i32),
            tomorrow: (tomorrow.month() as i32, tomorrow.day() as i32),
            feb_29_fallback_active,
        }
    }
}

#[async_trait]
impl UserStore for PostgresUserStore {
    async fn find_by_id(&self, id: UserId) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, first_name, email, timezone, birthday, anniversary, deleted FROM users WHERE id = $1 AND deleted = false",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    fn users_with_birthday_near_today(&self) -> BoxStream<'_, anyhow::Result<User>> {
        let window = Self::near_today_window();
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, first_name, email, timezone, birthday, anniversary, deleted
            FROM users
            WHERE deleted = false
              AND birthday IS NOT NULL
              AND (
                (EXTRACT(MONTH FROM birthday) = $1 AND EXTRACT(DAY FROM birthday) = $2)
                OR (EXTRACT(MONTH FROM birthday) = $3 AND EXTRACT(DAY FROM birthday) = $4)
                OR (EXTRACT(MONTH FROM birthday) = $5 AND EXTRACT(DAY FROM birthday) = $6)
                OR ($7::int IS NOT NULL AND EXTRACT(MONTH FROM birthday) = 2 AND EXTRACT(DAY FROM birthday) = 29)
              )
            "#,
        )
        .bind(window.yesterday.0)
        .bind(window.yesterday.1)
        .bind(window.today.0)
        .bind(window.today.1)
        .bind(window.tomorrow.0)
        .bind(window.tomorrow.1)
        .bind(window.feb_29_fallback_active.then_some(1i32))
        .fetch(&self.pool)
        .map(|r| r.map_err(anyhow::Error::from))
        .boxed()
    }

    fn users_with_anniversary_near_today(&self) -> BoxStream<'_, anyhow::Result<User>> {
        let window = Self::near_today_window();
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, first_name, email, timezone, birthday, anniversary, deleted
            FROM users
            WHERE deleted = false
              AND anniversary IS NOT NULL
              AND (
                (EXTRACT(MONTH FROM anniversary) = $1 AND EXTRACT(DAY FROM anniversary) = $2)
                OR (EXTRACT(MONTH FROM anniversary) = $3 AND EXTRACT(DAY FROM anniversary) = $4)
                OR (EXTRACT(MONTH FROM anniversary) = $5 AND EXTRACT(DAY FROM anniversary) = $6)
                OR ($7::int IS NOT NULL AND EXTRACT(MONTH FROM anniversary) = 2 AND EXTRACT(DAY FROM anniversary) = 29)
              )
            "#,
        )
        .bind(window.yesterday.0)
        .bind(window.yesterday.1)
        .bind(window.today.0)
        .bind(window.today.1)
        .bind(window.tomorrow.0)
        .bind(window.tomorrow.1)
        .bind(window.feb_29_fallback_active.then_some(1i32))
        .fetch(&self.pool)
        .map(|r| r.map_err(anyhow::Error::from))
        .boxed()
    }
}

/// In-memory double for the daily materializer's unit tests.
pub struct InMemoryUserStore {
    users: Vec<User>,
}

impl InMemoryUserStore {
    pub fn new(users: Vec<User>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn find_by_id(&self, id: UserId) -> anyhow::Result<Option<User>> {
        Ok(self.users.iter().find(|u| u.id == id && !u.deleted).cloned())
    }

    fn users_with_birthday_near_today(&self) -> BoxStream<'_, anyhow::Result<User>> {
        stream::iter(
            self.users
                .iter()
                .filter(|u| !u.deleted && u.birthday.is_some())
                .cloned()
                .map(Ok),
        )
        .boxed()
    }

    fn users_with_anniversary_near_today(&self) -> BoxStream<'_, anyhow::Result<User>> {
        stream::iter(
            self.users
                .iter()
                .filter(|u| !u.deleted && u.anniversary.is_some())
                .cloned()
                .map(Ok),
        )
        .boxed()
    }
}
