use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::common::UserId;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub first_name: String,
    pub email: String,
    pub timezone: String,
    pub birthday: Option<NaiveDate>,
    pub anniversary: Option<NaiveDate>,
    pub deleted: bool,
}
