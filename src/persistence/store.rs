use crate::models::{
    groupcall, groupcall_ptt, groupcall_status_change, indicall, indicall_ptt,
    indicall_status_change, keepalive, sdsdata, sdsstatus, voicegroupcall, voiceindicall, Migrator,
};
use crate::protocol::{
    GroupCallChange, GroupCallPttActive, GroupCallPttIdle, GroupCallRelease, IndiCallChange,
    IndiCallPtt, IndiCallRelease, KeepAlive, StatusSds, TextSds,
};
use anyhow::{Context, Result};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Database, DatabaseConnection, EntityTrait, NotSet, QueryFilter,
    QueryOrder, Set,
};
use sea_orm_migration::MigratorTrait;

/// Which pair of call/voice tables a recorded call lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceTable {
    Individual,
    Group,
}

impl VoiceTable {
    /// Playback requests carry `I` or `G`.
    pub fn from_api_tag(tag: &str) -> Option<Self> {
        match tag {
            "I" => Some(Self::Individual),
            "G" => Some(Self::Group),
            _ => None,
        }
    }
}

/// Key columns of the newest call row for a call id, used to anchor the
/// voice recording row.
#[derive(Debug, Clone)]
pub struct CallRowRef {
    pub db_id: i64,
    pub call_begin: sea_orm::prelude::DateTime,
    pub call_end: Option<sea_orm::prelude::DateTime>,
}

/// Storage facade: every signaling event maps to exactly one SQL statement
/// (the keep-alive upsert keeps its legacy select-then-write shape).
pub struct CallStore {
    db: DatabaseConnection,
}

fn to_datetime(ts: u64) -> sea_orm::prelude::DateTime {
    chrono::DateTime::from_timestamp(ts as i64, 0)
        .unwrap_or_default()
        .naive_utc()
}

impl CallStore {
    pub async fn connect(conn_info: &str) -> Result<Self> {
        let db = Database::connect(conn_info)
            .await
            .with_context(|| format!("connect to storage {}", conn_info))?;
        Migrator::up(&db, None).await.context("run migrations")?;
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    pub async fn save_keep_alive(&self, ts: u64, ka: &KeepAlive) -> Result<()> {
        let existing = keepalive::Entity::find_by_id(ka.log_server_no as i32)
            .one(&self.db)
            .await?;
        match existing {
            Some(row) => {
                let mut active: keepalive::ActiveModel = row.into();
                active.last_heartbeat = Set(to_datetime(ts));
                active.timeout = Set(ka.timeout as i32);
                active.sw_ver = Set(ka.sw_ver.clone());
                active.sw_ver_string = Set(ka.sw_ver_string.clone());
                active.log_server_descr = Set(ka.descr.clone());
                active.update(&self.db).await?;
            }
            None => {
                keepalive::ActiveModel {
                    log_server_no: Set(ka.log_server_no as i32),
                    last_heartbeat: Set(to_datetime(ts)),
                    timeout: Set(ka.timeout as i32),
                    sw_ver: Set(ka.sw_ver.clone()),
                    sw_ver_string: Set(ka.sw_ver_string.clone()),
                    log_server_descr: Set(ka.descr.clone()),
                }
                .insert(&self.db)
                .await?;
            }
        }
        Ok(())
    }

    /// Setup row for a new individual call; `simplex_duplex` is 1 for duplex.
    pub async fn save_indi_call_setup(
        &self,
        ts: u64,
        change: &IndiCallChange,
        duplex: bool,
    ) -> Result<()> {
        indicall::ActiveModel {
            db_id: NotSet,
            call_id: Set(change.call_id as i64),
            timeout: Set(change.timeout as i32),
            call_begin: Set(to_datetime(ts)),
            call_end: NotSet,
            seq_no_begin: Set(change.header.sequence as i32),
            seq_no_end: NotSet,
            calling_ssi: Set(change.a_party.tsi.ssi as i64),
            calling_mnc: Set(change.a_party.tsi.mnc as i32),
            calling_mcc: Set(change.a_party.tsi.mcc as i32),
            calling_esn: Set(change.a_party.number.clone()),
            calling_descr: Set(change.a_party.descr.clone()),
            called_ssi: Set(change.b_party.tsi.ssi as i64),
            called_mnc: Set(change.b_party.tsi.mnc as i32),
            called_mcc: Set(change.b_party.tsi.mcc as i32),
            called_esn: Set(change.b_party.number.clone()),
            called_descr: Set(change.b_party.descr.clone()),
            simplex_duplex: Set(if duplex { 1 } else { 0 }),
            disconnect_cause: NotSet,
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    /// Change row for an already established individual call.
    pub async fn save_indi_call_change(&self, ts: u64, change: &IndiCallChange) -> Result<()> {
        indicall_status_change::ActiveModel {
            db_id: NotSet,
            call_id: Set(change.call_id as i64),
            seq_no: Set(change.header.sequence as i32),
            received_at: Set(to_datetime(ts)),
            action_id: Set(change.action as i32),
            timeout: Set(change.timeout as i32),
            calling_ssi: Set(change.a_party.tsi.ssi as i64),
            calling_mnc: Set(change.a_party.tsi.mnc as i32),
            calling_mcc: Set(change.a_party.tsi.mcc as i32),
            calling_esn: Set(change.a_party.number.clone()),
            calling_descr: Set(change.a_party.descr.clone()),
            called_ssi: Set(change.b_party.tsi.ssi as i64),
            called_mnc: Set(change.b_party.tsi.mnc as i32),
            called_mcc: Set(change.b_party.tsi.mcc as i32),
            called_esn: Set(change.b_party.number.clone()),
            called_descr: Set(change.b_party.descr.clone()),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    pub async fn save_indi_call_release(&self, ts: u64, release: &IndiCallRelease) -> Result<()> {
        indicall::Entity::update_many()
            .col_expr(indicall::Column::CallEnd, Expr::value(to_datetime(ts)))
            .col_expr(
                indicall::Column::SeqNoEnd,
                Expr::value(release.header.sequence as i32),
            )
            .col_expr(
                indicall::Column::DisconnectCause,
                Expr::value(release.cause as i32),
            )
            .filter(indicall::Column::CallId.eq(release.call_id as i64))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn save_simplex_ptt(&self, ts: u64, ptt: &IndiCallPtt) -> Result<()> {
        indicall_ptt::ActiveModel {
            db_id: NotSet,
            call_id: Set(ptt.call_id as i64),
            seq_no: Set(ptt.header.sequence as i32),
            received_at: Set(to_datetime(ts)),
            talking_party: Set(ptt.talking_party as i32),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    pub async fn save_group_call_setup(&self, ts: u64, change: &GroupCallChange) -> Result<()> {
        groupcall::ActiveModel {
            db_id: NotSet,
            call_id: Set(change.call_id as i64),
            timeout: Set(change.timeout as i32),
            call_begin: Set(to_datetime(ts)),
            call_end: NotSet,
            seq_no_begin: Set(change.header.sequence as i32),
            seq_no_end: NotSet,
            group_ssi: Set(change.group.tsi.ssi as i64),
            group_mnc: Set(change.group.tsi.mnc as i32),
            group_mcc: Set(change.group.tsi.mcc as i32),
            group_esn: Set(change.group.number.clone()),
            group_descr: Set(change.group.descr.clone()),
            disconnect_cause: NotSet,
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    pub async fn save_group_call_change(&self, ts: u64, change: &GroupCallChange) -> Result<()> {
        groupcall_status_change::ActiveModel {
            db_id: NotSet,
            call_id: Set(change.call_id as i64),
            timeout: Set(change.timeout as i32),
            seq_no: Set(change.header.sequence as i32),
            received_at: Set(to_datetime(ts)),
            message_id: Set(change.header.msg_id as i32),
            action_id: Set(change.action as i32),
            group_ssi: Set(change.group.tsi.ssi as i64),
            group_mnc: Set(change.group.tsi.mnc as i32),
            group_mcc: Set(change.group.tsi.mcc as i32),
            group_esn: Set(change.group.number.clone()),
            group_descr: Set(change.group.descr.clone()),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    pub async fn save_group_ptt_active(&self, ts: u64, ptt: &GroupCallPttActive) -> Result<()> {
        groupcall_ptt::ActiveModel {
            db_id: NotSet,
            call_id: Set(ptt.call_id as i64),
            seq_no: Set(ptt.header.sequence as i32),
            received_at: Set(to_datetime(ts)),
            message_id: Set(ptt.header.msg_id as i32),
            tp_ssi: Set(Some(ptt.talking_party.tsi.ssi as i64)),
            tp_mnc: Set(Some(ptt.talking_party.tsi.mnc as i32)),
            tp_mcc: Set(Some(ptt.talking_party.tsi.mcc as i32)),
            tp_esn: Set(Some(ptt.talking_party.number.clone())),
            tp_descr: Set(Some(ptt.talking_party.descr.clone())),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    pub async fn save_group_ptt_idle(&self, ts: u64, ptt: &GroupCallPttIdle) -> Result<()> {
        groupcall_ptt::ActiveModel {
            db_id: NotSet,
            call_id: Set(ptt.call_id as i64),
            seq_no: Set(ptt.header.sequence as i32),
            received_at: Set(to_datetime(ts)),
            message_id: Set(ptt.header.msg_id as i32),
            tp_ssi: Set(None),
            tp_mnc: Set(None),
            tp_mcc: Set(None),
            tp_esn: Set(None),
            tp_descr: Set(None),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    pub async fn save_group_call_release(&self, ts: u64, release: &GroupCallRelease) -> Result<()> {
        groupcall::Entity::update_many()
            .col_expr(groupcall::Column::CallEnd, Expr::value(to_datetime(ts)))
            .col_expr(
                groupcall::Column::SeqNoEnd,
                Expr::value(release.header.sequence as i32),
            )
            .col_expr(
                groupcall::Column::DisconnectCause,
                Expr::value(release.cause as i32),
            )
            .filter(groupcall::Column::CallId.eq(release.call_id as i64))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn save_status_sds(&self, ts: u64, sds: &StatusSds) -> Result<()> {
        sdsstatus::ActiveModel {
            db_id: NotSet,
            received_at: Set(to_datetime(ts)),
            calling_ssi: Set(sds.a_party.tsi.ssi as i64),
            calling_mnc: Set(sds.a_party.tsi.mnc as i32),
            calling_mcc: Set(sds.a_party.tsi.mcc as i32),
            calling_esn: Set(sds.a_party.number.clone()),
            calling_descr: Set(sds.a_party.descr.clone()),
            called_ssi: Set(sds.b_party.tsi.ssi as i64),
            called_mnc: Set(sds.b_party.tsi.mnc as i32),
            called_mcc: Set(sds.b_party.tsi.mcc as i32),
            called_esn: Set(sds.b_party.number.clone()),
            called_descr: Set(sds.b_party.descr.clone()),
            precoded_status_value: Set(sds.status_value as i32),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    pub async fn save_text_sds(&self, ts: u64, sds: &TextSds) -> Result<()> {
        sdsdata::ActiveModel {
            db_id: NotSet,
            received_at: Set(to_datetime(ts)),
            calling_ssi: Set(sds.a_party.tsi.ssi as i64),
            calling_mnc: Set(sds.a_party.tsi.mnc as i32),
            calling_mcc: Set(sds.a_party.tsi.mcc as i32),
            calling_esn: Set(sds.a_party.number.clone()),
            calling_descr: Set(sds.a_party.descr.clone()),
            called_ssi: Set(sds.b_party.tsi.ssi as i64),
            called_mnc: Set(sds.b_party.tsi.mnc as i32),
            called_mcc: Set(sds.b_party.tsi.mcc as i32),
            called_esn: Set(sds.b_party.number.clone()),
            called_descr: Set(sds.b_party.descr.clone()),
            user_data_length: Set(sds.text.len() as i32),
            user_data: Set(sds.text.clone()),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    /// Newest call row for a call id, the anchor for its voice recording.
    pub async fn find_call_row(&self, table: VoiceTable, call_id: u32) -> Result<Option<CallRowRef>> {
        let row = match table {
            VoiceTable::Individual => indicall::Entity::find()
                .filter(indicall::Column::CallId.eq(call_id as i64))
                .order_by_desc(indicall::Column::CallBegin)
                .one(&self.db)
                .await?
                .map(|row| CallRowRef {
                    db_id: row.db_id,
                    call_begin: row.call_begin,
                    call_end: row.call_end,
                }),
            VoiceTable::Group => groupcall::Entity::find()
                .filter(groupcall::Column::CallId.eq(call_id as i64))
                .order_by_desc(groupcall::Column::CallBegin)
                .one(&self.db)
                .await?
                .map(|row| CallRowRef {
                    db_id: row.db_id,
                    call_begin: row.call_begin,
                    call_end: row.call_end,
                }),
        };
        Ok(row)
    }

    pub async fn save_voice_recording(
        &self,
        table: VoiceTable,
        call_row: &CallRowRef,
        blob: Vec<u8>,
        duration: String,
    ) -> Result<()> {
        let len = blob.len() as i64;
        match table {
            VoiceTable::Individual => {
                voiceindicall::ActiveModel {
                    db_id: Set(call_row.db_id),
                    call_begin: Set(call_row.call_begin),
                    call_end: Set(call_row.call_end),
                    voice_data_len: Set(len),
                    voice_data: Set(blob),
                    duration: Set(duration),
                }
                .insert(&self.db)
                .await?;
            }
            VoiceTable::Group => {
                voicegroupcall::ActiveModel {
                    db_id: Set(call_row.db_id),
                    call_begin: Set(call_row.call_begin),
                    call_end: Set(call_row.call_end),
                    voice_data_len: Set(len),
                    voice_data: Set(blob),
                    duration: Set(duration),
                }
                .insert(&self.db)
                .await?;
            }
        }
        Ok(())
    }

    /// Persisted voice blob for a playback request.
    pub async fn fetch_voice_blob(&self, table: VoiceTable, db_id: i64) -> Result<Option<Vec<u8>>> {
        let blob = match table {
            VoiceTable::Individual => voiceindicall::Entity::find_by_id(db_id)
                .one(&self.db)
                .await?
                .map(|row| row.voice_data),
            VoiceTable::Group => voicegroupcall::Entity::find_by_id(db_id)
                .one(&self.db)
                .await?
                .map(|row| row.voice_data),
        };
        Ok(blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::*;

    fn header(msg_id: u8, sequence: u16) -> MessageHeader {
        MessageHeader {
            sequence,
            api_version: 1,
            msg_id,
        }
    }

    fn party(ssi: u32, descr: &str) -> Party {
        Party {
            tsi: Tsi {
                ssi,
                mnc: 201,
                mcc: 214,
            },
            number: "1234".to_string(),
            descr: descr.to_string(),
        }
    }

    async fn store() -> CallStore {
        CallStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn keep_alive_upserts_by_log_server_no() {
        let store = store().await;
        let mut ka = KeepAlive {
            header: header(MSG_KEEP_ALIVE, 1),
            log_server_no: 7,
            timeout: 30,
            sw_ver: "7.60".to_string(),
            sw_ver_string: "7.60.1".to_string(),
            descr: "logserver".to_string(),
        };
        store.save_keep_alive(1000, &ka).await.unwrap();
        ka.timeout = 60;
        store.save_keep_alive(2000, &ka).await.unwrap();

        let rows = keepalive::Entity::find().all(store.connection()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].log_server_no, 7);
        assert_eq!(rows[0].timeout, 60);
    }

    #[tokio::test]
    async fn simplex_call_lifecycle_rows() {
        let store = store().await;
        let change = IndiCallChange {
            header: header(MSG_SIMPLEX_CALL_CHANGE, 5),
            call_id: 100,
            action: CallChangeAction::NewCallSetup,
            timeout: 30,
            a_party: party(1001, "alice"),
            b_party: party(1002, "bob"),
        };
        store.save_indi_call_setup(1000, &change, false).await.unwrap();
        store
            .save_indi_call_release(
                1015,
                &IndiCallRelease {
                    header: header(MSG_SIMPLEX_CALL_RELEASE, 9),
                    call_id: 100,
                    cause: ReleaseCause::ARelease,
                },
            )
            .await
            .unwrap();

        let rows = indicall::Entity::find().all(store.connection()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].simplex_duplex, 0);
        assert_eq!(rows[0].seq_no_begin, 5);
        assert_eq!(rows[0].seq_no_end, Some(9));
        assert_eq!(rows[0].disconnect_cause, Some(1));
        assert!(rows[0].call_end.is_some());
    }

    #[tokio::test]
    async fn non_setup_change_lands_in_the_status_table() {
        let store = store().await;
        let change = IndiCallChange {
            header: header(MSG_DUPLEX_CALL_CHANGE, 2),
            call_id: 55,
            action: CallChangeAction::CallThroughConnect,
            timeout: 30,
            a_party: party(1, "a"),
            b_party: party(2, "b"),
        };
        store.save_indi_call_change(1000, &change).await.unwrap();

        assert!(indicall::Entity::find()
            .all(store.connection())
            .await
            .unwrap()
            .is_empty());
        let rows = indicall_status_change::Entity::find()
            .all(store.connection())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].action_id, 2);
    }

    #[tokio::test]
    async fn voice_recording_anchors_to_the_newest_call_row() {
        let store = store().await;
        let change = IndiCallChange {
            header: header(MSG_SIMPLEX_CALL_CHANGE, 1),
            call_id: 100,
            action: CallChangeAction::NewCallSetup,
            timeout: 30,
            a_party: party(1001, "alice"),
            b_party: party(1002, "bob"),
        };
        store.save_indi_call_setup(1000, &change, false).await.unwrap();

        let row = store
            .find_call_row(VoiceTable::Individual, 100)
            .await
            .unwrap()
            .expect("call row");
        let blob = vec![0xd5u8; 46 + 480];
        store
            .save_voice_recording(VoiceTable::Individual, &row, blob.clone(), "0:0:0.060".into())
            .await
            .unwrap();

        let fetched = store
            .fetch_voice_blob(VoiceTable::Individual, row.db_id)
            .await
            .unwrap()
            .expect("voice blob");
        assert_eq!(fetched, blob);
        let voice_rows = voiceindicall::Entity::find()
            .all(store.connection())
            .await
            .unwrap();
        assert_eq!(voice_rows[0].voice_data_len, blob.len() as i64);
    }

    #[tokio::test]
    async fn group_ptt_idle_leaves_party_columns_null() {
        let store = store().await;
        store
            .save_group_ptt_idle(
                1000,
                &GroupCallPttIdle {
                    header: header(MSG_GROUP_CALL_PTT_IDLE, 3),
                    call_id: 9,
                },
            )
            .await
            .unwrap();
        let rows = groupcall_ptt::Entity::find()
            .all(store.connection())
            .await
            .unwrap();
        assert_eq!(rows[0].tp_ssi, None);
        assert_eq!(rows[0].message_id, MSG_GROUP_CALL_PTT_IDLE as i32);
    }

    #[tokio::test]
    async fn sds_rows_record_both_parties() {
        let store = store().await;
        store
            .save_text_sds(
                1000,
                &TextSds {
                    header: header(MSG_SDS_TEXT, 4),
                    a_party: party(1, "a"),
                    b_party: party(2, "b"),
                    text: "status report".to_string(),
                },
            )
            .await
            .unwrap();
        let rows = sdsdata::Entity::find().all(store.connection()).await.unwrap();
        assert_eq!(rows[0].user_data, "status report");
        assert_eq!(rows[0].user_data_length, 13);
    }
}
