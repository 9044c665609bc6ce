use crate::error::{Error, Result};

/// Number of lines a master-info file carries: the count line itself
/// plus 14 fields.
const LINE_COUNT: u32 = 15;

/// The replication `master.info` file: a newline-delimited text format
/// whose first line declares the line count.
///
/// Integer fields are base-10 ASCII; string fields run to the newline.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MasterInfo {
    pub master_log_file: String,
    pub master_log_pos: u64,
    pub master_host: String,
    pub master_user: String,
    pub master_password: String,
    pub master_port: u16,
    pub master_connect_retry: u32,
    pub master_ssl: bool,
    pub master_ssl_ca: String,
    pub master_ssl_capath: String,
    pub master_ssl_cert: String,
    pub master_ssl_cipher: String,
    pub master_ssl_key: String,
    pub master_ssl_verify_server_cert: bool,
}

impl MasterInfo {
    pub fn decode(text: &str) -> Result<Self> {
        let mut lines = text.split('\n');

        let mut next = |field: &'static str| {
            lines
                .next()
                .ok_or_else(|| Error::Configuration(format!("master-info: missing {field}")))
        };

        let declared: u32 = parse_int(next("line count")?, "line count")?;
        if declared < LINE_COUNT {
            return Err(Error::Configuration(format!(
                "master-info: declares {declared} lines, needs at least {LINE_COUNT}"
            )));
        }

        Ok(Self {
            master_log_file: next("log file")?.to_owned(),
            master_log_pos: parse_int(next("log pos")?, "log pos")?,
            master_host: next("host")?.to_owned(),
            master_user: next("user")?.to_owned(),
            master_password: next("password")?.to_owned(),
            master_port: parse_int(next("port")?, "port")?,
            master_connect_retry: parse_int(next("connect retry")?, "connect retry")?,
            master_ssl: parse_int::<u8>(next("ssl")?, "ssl")? != 0,
            master_ssl_ca: next("ssl ca")?.to_owned(),
            master_ssl_capath: next("ssl capath")?.to_owned(),
            master_ssl_cert: next("ssl cert")?.to_owned(),
            master_ssl_cipher: next("ssl cipher")?.to_owned(),
            master_ssl_key: next("ssl key")?.to_owned(),
            master_ssl_verify_server_cert: parse_int::<u8>(
                next("verify server cert")?,
                "verify server cert",
            )? != 0,
        })
    }

    pub fn encode(&self) -> String {
        format!(
            "{LINE_COUNT}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n",
            self.master_log_file,
            self.master_log_pos,
            self.master_host,
            self.master_user,
            self.master_password,
            self.master_port,
            self.master_connect_retry,
            u8::from(self.master_ssl),
            self.master_ssl_ca,
            self.master_ssl_capath,
            self.master_ssl_cert,
            self.master_ssl_cipher,
            self.master_ssl_key,
            u8::from(self.master_ssl_verify_server_cert),
        )
    }
}

fn parse_int<T: std::str::FromStr>(line: &str, field: &'static str) -> Result<T> {
    line.trim_end_matches('\r')
        .parse()
        .map_err(|_| Error::Configuration(format!("master-info: malformed {field}: {line:?}")))
}
