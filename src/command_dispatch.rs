//! Purpose: Route one parsed wire command to an internal handler or a package call.
//! Exports: `CommandDispatcher`.
//! Role: Transport-independent layer between RESP framing and the package registry.
//! Invariants: Every command produces exactly one reply; failures never close the connection.
//! Invariants: Internal command names match case-insensitively; package targets do not.
//! Notes: Arguments are JSON documents; results are encoded back as JSON bulk payloads.

use std::sync::Arc;

use bstr::ByteSlice;
use tracing::debug;

use gedis::api::{ApiResult, Error, ErrorKind, PackageManager, Value};
use gedis::resp::{Command, ReplyWriter};

const INTERNAL_PREFIX: u8 = b'.';
const CONTENT_TYPE: &str = "application/json";

pub struct CommandDispatcher {
    manager: Arc<PackageManager>,
}

impl CommandDispatcher {
    pub fn new(manager: Arc<PackageManager>) -> Self {
        Self { manager }
    }

    pub fn dispatch(&self, command: &Command, out: &mut dyn ReplyWriter) {
        let result = if command.name.first() == Some(&INTERNAL_PREFIX) {
            self.handle_internal(command, out)
        } else {
            self.handle_call(command, out)
        };
        if let Err(err) = result {
            debug!(
                command = %command.name.as_bstr(),
                kind = ?err.kind(),
                error = %err.chain_message(),
                "command failed"
            );
            out.write_error(&format!("ERR {}", err.chain_message()));
        }
    }

    fn handle_internal(&self, command: &Command, out: &mut dyn ReplyWriter) -> ApiResult<()> {
        let name = command.name.to_str_lossy().to_lowercase();
        match name.as_str() {
            ".ping" => {
                expect_args(&name, command, 0)?;
                out.write_string("PONG");
            }
            ".package.list" => {
                expect_args(&name, command, 0)?;
                let mut names = self.manager.list();
                names.sort();
                out.write_array(names.len());
                for name in names {
                    out.write_bulk(name.as_bytes());
                }
            }
            ".package.add" => {
                expect_args(&name, command, 2)?;
                let package = utf8_arg(&command.args[0], "package name")?;
                let path = command.args[1].to_path().map_err(|err| {
                    Error::new(ErrorKind::Usage)
                        .with_message("package path is not valid UTF-8")
                        .with_source(err)
                })?;
                self.manager.add(package, path)?;
                out.write_string("OK");
            }
            ".package.remove" => {
                expect_args(&name, command, 1)?;
                let package = utf8_arg(&command.args[0], "package name")?;
                self.manager.remove(package)?;
                out.write_string("OK");
            }
            ".content-type.get" => {
                expect_args(&name, command, 0)?;
                out.write_string(CONTENT_TYPE);
            }
            ".content-type.set" => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("setting the content type is not implemented")
                    .with_hint(format!("Arguments and results are always {CONTENT_TYPE}.")));
            }
            _ => {
                return Err(Error::new(ErrorKind::NotFound)
                    .with_message(format!("unknown command '{name}'")));
            }
        }
        Ok(())
    }

    fn handle_call(&self, command: &Command, out: &mut dyn ReplyWriter) -> ApiResult<()> {
        let (package, action) = split_target(&command.name)?;
        let args = decode_args(&command.args)?;
        let results = self.manager.call(package, action, &args)?;

        match results.as_slice() {
            [] => out.write_string("OK"),
            [single] => out.write_bulk(&encode_result(single)?),
            many => {
                let payloads = many
                    .iter()
                    .map(encode_result)
                    .collect::<Result<Vec<_>, _>>()?;
                out.write_array(payloads.len());
                for payload in payloads {
                    out.write_bulk(&payload);
                }
            }
        }
        Ok(())
    }
}

/// Splits `<package>.<action>` on the first dot; both parts must be non-empty.
fn split_target(name: &[u8]) -> ApiResult<(&str, &str)> {
    let format_error = || {
        Error::new(ErrorKind::Usage).with_message(format!(
            "invalid command name format expecting <package>.<action> got '{}'",
            name.as_bstr()
        ))
    };
    let name = std::str::from_utf8(name).map_err(|_| format_error())?;
    match name.split_once('.') {
        Some((package, action)) if !package.is_empty() && !action.is_empty() => {
            Ok((package, action))
        }
        _ => Err(format_error()),
    }
}

fn decode_args(args: &[Vec<u8>]) -> ApiResult<Vec<Value>> {
    args.iter()
        .enumerate()
        .map(|(index, input)| {
            serde_json::from_slice::<serde_json::Value>(input)
                .map(Value::from)
                .map_err(|err| {
                    Error::new(ErrorKind::Usage)
                        .with_message(format!("failed to load argument '{index}'"))
                        .with_source(err)
                })
        })
        .collect()
}

fn encode_result(value: &Value) -> ApiResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode result")
            .with_source(err)
    })
}

fn expect_args(name: &str, command: &Command, count: usize) -> ApiResult<()> {
    if command.args.len() != count {
        return Err(Error::new(ErrorKind::Usage).with_message(format!(
            "wrong number of arguments for '{name}': expected {count}, got {}",
            command.args.len()
        )));
    }
    Ok(())
}

fn utf8_arg<'a>(arg: &'a [u8], what: &str) -> ApiResult<&'a str> {
    std::str::from_utf8(arg).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("{what} is not valid UTF-8"))
            .with_source(err)
    })
}
