//! Per-command response classification.
//!
//! Every command the client can send has a fixed response shape; the
//! trackers here consume server packets one at a time and report when
//! the command is complete, so the state machine knows when to hand the
//! turn back to the client.

use crate::error::Result;
use crate::io::BufExt;
use crate::protocol::response::{EofPacket, OkPacket};
use crate::protocol::{Command, Status};

/// Sub-states of a `COM_QUERY`-shaped response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPhase {
    Init,
    Field,
    Result,
    LocalInfileData,
    LocalInfileResult,
}

/// Tracks `COM_QUERY`, `COM_PROCESS_INFO`, and `COM_STMT_EXECUTE`
/// responses: OK/ERR, result sets (fields, rows, multi-result chains),
/// and the LOAD DATA LOCAL INFILE detour.
#[derive(Debug)]
pub struct QueryTracker {
    pub phase: QueryPhase,

    pub server_status: Status,
    pub warnings: u16,
    pub affected_rows: u64,
    pub insert_id: u64,

    pub was_resultset: bool,

    pub rows: u64,
    pub bytes: u64,
}

impl QueryTracker {
    fn new() -> Self {
        Self {
            phase: QueryPhase::Init,
            server_status: Status::empty(),
            warnings: 0,
            affected_rows: 0,
            insert_id: 0,
            was_resultset: false,
            rows: 0,
            bytes: 0,
        }
    }

    fn track(&mut self, payload: &[u8]) -> Result<bool> {
        let lead = *payload
            .first()
            .ok_or_else(|| err_protocol!("zero-length response packet"))?;

        match self.phase {
            QueryPhase::Init => match lead {
                0x00 => {
                    let ok = OkPacket::decode(payload)?;

                    self.server_status = ok.status;
                    self.warnings = ok.warnings;
                    self.affected_rows = ok.affected_rows;
                    self.insert_id = ok.insert_id;
                    self.was_resultset = false;

                    // a multi-result chain continues with another
                    // INIT-shaped packet
                    Ok(!ok.status.contains(Status::SERVER_MORE_RESULTS_EXISTS))
                }

                0xFF => Ok(true),

                // LOAD DATA LOCAL INFILE: the server asks the client
                // for the named file's content
                0xFB => {
                    self.phase = QueryPhase::LocalInfileData;
                    Ok(true)
                }

                0xFE => Err(err_protocol!(
                    "EOF is illegal as the first packet of a command response"
                )),

                _ => {
                    // column count
                    self.phase = QueryPhase::Field;
                    Ok(false)
                }
            },

            QueryPhase::Field => {
                if EofPacket::is_eof(payload) {
                    let eof = EofPacket::decode(payload)?;
                    self.server_status = eof.status;
                    self.warnings = eof.warnings;

                    // a cursor holds the rows server-side; the command
                    // is done after the field list
                    if eof.status.contains(Status::SERVER_STATUS_CURSOR_EXISTS) {
                        return Ok(true);
                    }

                    self.phase = QueryPhase::Result;
                }

                Ok(false)
            }

            QueryPhase::Result => {
                if EofPacket::is_eof(payload) {
                    let eof = EofPacket::decode(payload)?;
                    self.server_status = eof.status;
                    self.warnings = eof.warnings;
                    self.was_resultset = true;

                    if eof.status.contains(Status::SERVER_MORE_RESULTS_EXISTS) {
                        self.phase = QueryPhase::Init;
                        return Ok(false);
                    }

                    return Ok(true);
                }

                if lead == 0xFF {
                    // the row stream died mid-way
                    return Ok(true);
                }

                self.rows += 1;
                self.bytes += payload.len() as u64;

                Ok(false)
            }

            QueryPhase::LocalInfileData => Err(err_protocol!(
                "server packet while the client owes LOAD DATA LOCAL INFILE content"
            )),

            QueryPhase::LocalInfileResult => match lead {
                0x00 | 0xFF => Ok(true),
                _ => Err(err_protocol!(
                    "expected OK or ERR after LOAD DATA LOCAL INFILE; received 0x{lead:02X}"
                )),
            },
        }
    }
}

/// One tracker per command in flight.
#[derive(Debug)]
pub enum CommandTracker {
    Query(QueryTracker),

    /// First packet announces parameter and column counts; 0–2 EOF
    /// trailers follow.
    StmtPrepare { first_packet: bool, want_eofs: u8 },

    /// On OK, the database name is mirrored into both sockets.
    InitDb { db: String },

    /// One OK or one ERR.
    ChangeUser,

    /// One packet of any shape, no trailer.
    SinglePacket,

    /// One OK or one ERR.
    OkErr,

    /// One EOF or one ERR.
    EofErr,

    /// Field definitions until an EOF; a leading ERR also ends it.
    FieldList,

    /// Rows until an EOF carrying LAST_ROW_SENT or CURSOR_EXISTS.
    StmtFetch,

    /// Every packet completes, but the command never leaves the wire;
    /// the state machine keeps reading.
    BinlogDump,

    /// The server never answers.
    NoResponse,
}

impl CommandTracker {
    pub fn for_command(command: Command, payload: &[u8]) -> Result<CommandTracker> {
        Ok(match command {
            Command::Query | Command::ProcessInfo | Command::StmtExecute => {
                CommandTracker::Query(QueryTracker::new())
            }

            Command::StmtPrepare => CommandTracker::StmtPrepare {
                first_packet: true,
                want_eofs: 0,
            },

            Command::InitDb => {
                let mut buf = &payload[1..];
                let db = buf.get_str(buf.len())?.to_owned();

                CommandTracker::InitDb { db }
            }

            Command::ChangeUser => CommandTracker::ChangeUser,

            Command::Quit | Command::Statistics => CommandTracker::SinglePacket,

            Command::StmtReset
            | Command::Ping
            | Command::Time
            | Command::RegisterSlave
            | Command::ProcessKill => CommandTracker::OkErr,

            Command::Debug | Command::SetOption | Command::Shutdown => CommandTracker::EofErr,

            Command::FieldList => CommandTracker::FieldList,

            Command::StmtFetch => CommandTracker::StmtFetch,

            Command::BinlogDump => CommandTracker::BinlogDump,

            Command::StmtSendLongData | Command::StmtClose => CommandTracker::NoResponse,

            _ => {
                return Err(err_protocol!(
                    "response tracking for {command:?} is not implemented"
                ));
            }
        })
    }

    /// Feed one server packet payload; `true` when the command is done.
    pub fn track(&mut self, payload: &[u8]) -> Result<bool> {
        let lead = *payload
            .first()
            .ok_or_else(|| err_protocol!("zero-length response packet"))?;

        match self {
            CommandTracker::Query(tracker) => tracker.track(payload),

            CommandTracker::StmtPrepare {
                first_packet,
                want_eofs,
            } => {
                if *first_packet {
                    *first_packet = false;

                    if lead == 0xFF {
                        return Ok(true);
                    }

                    // COM_STMT_PREPARE OK: stmt id, column and
                    // parameter counts
                    let mut buf = &payload[1..];
                    let _stmt_id = buf.get_u32()?;
                    let num_columns = buf.get_u16()?;
                    let num_params = buf.get_u16()?;

                    *want_eofs = u8::from(num_columns > 0) + u8::from(num_params > 0);

                    return Ok(*want_eofs == 0);
                }

                if EofPacket::is_eof(payload) {
                    *want_eofs = want_eofs.saturating_sub(1);
                }

                Ok(*want_eofs == 0)
            }

            CommandTracker::InitDb { .. } => match lead {
                0x00 | 0xFF => Ok(true),
                _ => Err(err_protocol!(
                    "COM_INIT_DB response should be OK or ERR; received 0x{lead:02X}"
                )),
            },

            CommandTracker::ChangeUser => match lead {
                0x00 | 0xFF => Ok(true),
                _ => Err(err_protocol!(
                    "COM_CHANGE_USER response should be OK or ERR; received 0x{lead:02X}"
                )),
            },

            CommandTracker::SinglePacket => Ok(true),

            CommandTracker::OkErr => match lead {
                0x00 | 0xFF => Ok(true),
                _ => Err(err_protocol!(
                    "expected OK or ERR; received 0x{lead:02X}"
                )),
            },

            CommandTracker::EofErr => match lead {
                0xFE | 0xFF => Ok(true),
                _ => Err(err_protocol!(
                    "expected EOF or ERR; received 0x{lead:02X}"
                )),
            },

            CommandTracker::FieldList => {
                if lead == 0xFF || EofPacket::is_eof(payload) {
                    return Ok(true);
                }

                Ok(false)
            }

            CommandTracker::StmtFetch => {
                if EofPacket::is_eof(payload) {
                    let eof = EofPacket::decode(payload)?;

                    return Ok(eof.status.intersects(
                        Status::SERVER_STATUS_LAST_ROW_SENT | Status::SERVER_STATUS_CURSOR_EXISTS,
                    ));
                }

                Ok(lead == 0xFF)
            }

            CommandTracker::BinlogDump => Ok(true),

            CommandTracker::NoResponse => Err(err_protocol!(
                "received a response to a command that takes none"
            )),
        }
    }

    /// `true` once the tracked command turned out to be a LOAD DATA
    /// LOCAL INFILE request.
    pub fn is_local_infile(&self) -> bool {
        matches!(
            self,
            CommandTracker::Query(QueryTracker {
                phase: QueryPhase::LocalInfileData,
                ..
            })
        )
    }

    /// Move a local-infile tracker forward once the client's data has
    /// been relayed.
    pub fn infile_data_sent(&mut self) {
        if let CommandTracker::Query(tracker) = self {
            if tracker.phase == QueryPhase::LocalInfileData {
                tracker.phase = QueryPhase::LocalInfileResult;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandTracker, QueryPhase, QueryTracker};
    use crate::protocol::response::{EofPacket, OkPacket};
    use crate::protocol::{Command, Status};
    use matches::assert_matches;

    fn query_tracker() -> CommandTracker {
        CommandTracker::for_command(Command::Query, b"\x03SELECT 1").unwrap()
    }

    fn ok_payload(status: Status) -> Vec<u8> {
        let mut ok = OkPacket::new();
        ok.status = status;

        let mut buf = Vec::new();
        ok.encode(&mut buf);
        buf
    }

    fn eof_payload(status: Status) -> Vec<u8> {
        let mut buf = Vec::new();
        EofPacket::new(status).encode(&mut buf);
        buf
    }

    #[test]
    fn a_plain_ok_finishes_immediately() {
        let mut t = query_tracker();

        assert!(t.track(&ok_payload(Status::SERVER_STATUS_AUTOCOMMIT)).unwrap());

        if let CommandTracker::Query(q) = &t {
            assert!(!q.was_resultset);
        } else {
            unreachable!();
        }
    }

    #[test]
    fn an_err_finishes_immediately() {
        let mut t = query_tracker();

        assert!(t.track(b"\xff\x19\x04#42000boom").unwrap());
    }

    #[test]
    fn a_resultset_runs_fields_then_rows_then_eof() {
        let mut t = query_tracker();

        assert!(!t.track(b"\x01").unwrap()); // column count
        assert!(!t.track(b"\x03def...").unwrap()); // one field def
        assert!(!t.track(&eof_payload(Status::empty())).unwrap()); // end of fields
        assert!(!t.track(b"\x011").unwrap()); // one row
        assert!(t.track(&eof_payload(Status::empty())).unwrap()); // end of rows

        if let CommandTracker::Query(QueryTracker {
            was_resultset, rows, ..
        }) = &t
        {
            assert!(*was_resultset);
            assert_eq!(*rows, 1);
        } else {
            unreachable!();
        }
    }

    #[test]
    fn more_results_loops_back_to_init() {
        let mut t = query_tracker();

        assert!(!t
            .track(&ok_payload(
                Status::SERVER_STATUS_AUTOCOMMIT | Status::SERVER_MORE_RESULTS_EXISTS
            ))
            .unwrap());

        assert!(t.track(&ok_payload(Status::SERVER_STATUS_AUTOCOMMIT)).unwrap());
    }

    #[test]
    fn a_cursor_ends_after_the_field_list() {
        let mut t = query_tracker();

        assert!(!t.track(b"\x01").unwrap());
        assert!(!t.track(b"\x03def...").unwrap());
        assert!(t
            .track(&eof_payload(Status::SERVER_STATUS_CURSOR_EXISTS))
            .unwrap());
    }

    #[test]
    fn an_early_eof_is_a_protocol_violation() {
        let mut t = query_tracker();

        assert!(t.track(&eof_payload(Status::empty())).is_err());
    }

    #[test]
    fn a_local_infile_request_flips_the_phase() {
        let mut t = query_tracker();

        assert!(t.track(b"\xfb/tmp/data.csv").unwrap());
        assert!(t.is_local_infile());

        t.infile_data_sent();
        assert_matches!(
            &t,
            CommandTracker::Query(QueryTracker {
                phase: QueryPhase::LocalInfileResult,
                ..
            })
        );

        assert!(t.track(&ok_payload(Status::SERVER_STATUS_AUTOCOMMIT)).unwrap());
    }

    #[test]
    fn stmt_prepare_counts_its_eof_trailers() {
        let mut t = CommandTracker::for_command(Command::StmtPrepare, b"\x16SELECT ?").unwrap();

        // stmt id 1, one column, one param
        assert!(!t.track(b"\x00\x01\x00\x00\x00\x01\x00\x01\x00\x00\x00\x00").unwrap());
        assert!(!t.track(b"\x03def-param").unwrap());
        assert!(!t.track(&eof_payload(Status::empty())).unwrap());
        assert!(!t.track(b"\x03def-col").unwrap());
        assert!(t.track(&eof_payload(Status::empty())).unwrap());
    }

    #[test]
    fn stmt_prepare_err_finishes_at_once() {
        let mut t = CommandTracker::for_command(Command::StmtPrepare, b"\x16SELECT").unwrap();

        assert!(t.track(b"\xff\x28\x04#42000bad").unwrap());
    }

    #[test]
    fn init_db_remembers_the_name() {
        let t = CommandTracker::for_command(Command::InitDb, b"\x02shop").unwrap();

        assert_matches!(&t, CommandTracker::InitDb { db } if db == "shop");
    }

    #[test]
    fn change_user_takes_exactly_one_ok_or_err() {
        let mut t = CommandTracker::for_command(Command::ChangeUser, b"\x11root\x00").unwrap();
        assert!(t.track(&ok_payload(Status::SERVER_STATUS_AUTOCOMMIT)).unwrap());

        let mut t = CommandTracker::for_command(Command::ChangeUser, b"\x11root\x00").unwrap();
        assert!(t.track(b"\xff\x15\x04#28000denied").unwrap());

        let mut t = CommandTracker::for_command(Command::ChangeUser, b"\x11root\x00").unwrap();
        assert!(t.track(b"\x01row?").is_err());
    }

    #[test]
    fn stmt_fetch_stops_at_the_cursor_boundary() {
        let mut t = CommandTracker::for_command(Command::StmtFetch, b"\x1c").unwrap();

        assert!(!t.track(b"\x011").unwrap());
        assert!(!t.track(&eof_payload(Status::empty())).unwrap());
        assert!(t
            .track(&eof_payload(Status::SERVER_STATUS_LAST_ROW_SENT))
            .unwrap());
    }

    #[test]
    fn binlog_dump_never_leaves_the_wire() {
        let mut t = CommandTracker::for_command(Command::BinlogDump, b"\x12....").unwrap();

        // every event packet "finishes" so it is flushed to the client,
        // but the caller keeps the tracker and reads on
        assert!(t.track(b"\x00binlog-event").unwrap());
        assert!(t.track(b"\x00another-event").unwrap());
    }

    #[test]
    fn unhandled_commands_are_refused_up_front() {
        assert!(CommandTracker::for_command(Command::Sleep, b"\x00").is_err());
    }
}
