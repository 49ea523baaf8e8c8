/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, anyhow};
use humanize_rs::ParseError;
use yaml_rust::{Yaml, yaml};

use crate::{ErrorCode, MuxTransportConfig};

fn foreach_kv<F>(table: &yaml::Hash, mut f: F) -> anyhow::Result<()>
where
    F: FnMut(&str, &Yaml) -> anyhow::Result<()>,
{
    for (k, v) in table.iter() {
        if let Yaml::String(key) = k {
            f(key, v).context(format!("failed to parse value of key {key}"))?;
        } else {
            return Err(anyhow!("key in hash should be string"));
        }
    }
    Ok(())
}

fn normalize_key(raw: &str) -> String {
    raw.to_lowercase().replace('-', "_")
}

fn as_usize(v: &Yaml) -> anyhow::Result<usize> {
    match v {
        Yaml::String(s) => Ok(usize::from_str(s)?),
        Yaml::Integer(i) => Ok(usize::try_from(*i)?),
        _ => Err(anyhow!(
            "yaml value type for 'usize' should be 'string' or 'integer'"
        )),
    }
}

fn as_humanize_size(v: &Yaml) -> anyhow::Result<usize> {
    match v {
        Yaml::String(value) => {
            let v = value.parse::<humanize_rs::bytes::Bytes>()?;
            Ok(v.size())
        }
        Yaml::Integer(value) => Ok(usize::try_from(*value)?),
        _ => Err(anyhow!(
            "yaml value type for humanize usize should be 'string' or 'integer'"
        )),
    }
}

fn as_humanize_duration(v: &Yaml) -> anyhow::Result<Duration> {
    match v {
        Yaml::String(value) => match humanize_rs::duration::parse(value) {
            Ok(v) => Ok(v),
            Err(ParseError::MissingUnit) => {
                if let Ok(u) = u64::from_str(value) {
                    Ok(Duration::from_secs(u))
                } else if let Ok(f) = f64::from_str(value) {
                    Duration::try_from_secs_f64(f).map_err(anyhow::Error::new)
                } else {
                    Err(anyhow!("invalid duration string"))
                }
            }
            Err(e) => Err(anyhow!("invalid humanize duration string: {e}")),
        },
        Yaml::Integer(value) => {
            if let Ok(u) = u64::try_from(*value) {
                Ok(Duration::from_secs(u))
            } else {
                Err(anyhow!("unsupported duration string"))
            }
        }
        Yaml::Real(s) => {
            let f = f64::from_str(s).map_err(|e| anyhow!("invalid f64 value: {e}"))?;
            Duration::try_from_secs_f64(f).map_err(anyhow::Error::new)
        }
        _ => Err(anyhow!(
            "yaml value type for humanize duration should be 'string' or 'integer' or 'real'"
        )),
    }
}

pub fn as_error_code(v: &Yaml) -> anyhow::Result<ErrorCode> {
    match v {
        Yaml::String(s) => {
            let code = if let Some(hex) = s.strip_prefix("0x") {
                u64::from_str_radix(hex, 16)
            } else {
                u64::from_str(s)
            }
            .map_err(|e| anyhow!("invalid error code string: {e}"))?;
            Ok(ErrorCode::new(code)?)
        }
        Yaml::Integer(i) => Ok(ErrorCode::try_from(*i)?),
        _ => Err(anyhow!(
            "yaml value type for 'error code' should be 'string' or 'integer'"
        )),
    }
}

pub fn as_mux_transport_config(value: &Yaml) -> anyhow::Result<MuxTransportConfig> {
    if let Yaml::Hash(map) = value {
        let mut config = MuxTransportConfig::default();
        foreach_kv(map, |k, v| match normalize_key(k).as_str() {
            "stream_pool_capacity" | "stream_pool_size" => {
                let capacity = as_usize(v)?;
                config.set_stream_pool_capacity(capacity);
                Ok(())
            }
            "stream_pool_ttl" | "stream_pool_idle_timeout" => {
                let ttl = as_humanize_duration(v)
                    .context(format!("invalid humanize duration value for key {k}"))?;
                config.set_stream_pool_ttl(ttl);
                Ok(())
            }
            "max_read_buffer_size" => {
                let size = as_humanize_size(v)
                    .context(format!("invalid humanize usize value for key {k}"))?;
                config.set_max_read_buffer_size(size);
                Ok(())
            }
            "max_write_buffer_size" => {
                let size = as_humanize_size(v)
                    .context(format!("invalid humanize usize value for key {k}"))?;
                config.set_max_write_buffer_size(size);
                Ok(())
            }
            "recv_chunk_size" => {
                let size = as_humanize_size(v)
                    .context(format!("invalid humanize usize value for key {k}"))?;
                config.set_recv_chunk_size(size);
                Ok(())
            }
            "default_stream_error_code" => {
                let code = as_error_code(v)?;
                config.set_default_stream_error_code(code);
                Ok(())
            }
            "default_close_error_code" => {
                let code = as_error_code(v)?;
                config.set_default_close_error_code(code);
                Ok(())
            }
            "loop_exit_timeout" => {
                let timeout = as_humanize_duration(v)
                    .context(format!("invalid humanize duration value for key {k}"))?;
                config.set_loop_exit_timeout(timeout);
                Ok(())
            }
            "accept_backlog" => {
                let backlog = as_usize(v)?;
                config.set_accept_backlog(backlog);
                Ok(())
            }
            "heartbeat_interval" => {
                let interval = as_humanize_duration(v)
                    .context(format!("invalid humanize duration value for key {k}"))?;
                config.set_heartbeat_interval(interval);
                Ok(())
            }
            _ => Err(anyhow!("invalid key {k}")),
        })?;
        config.check()?;
        Ok(config)
    } else {
        Err(anyhow!(
            "yaml value type for 'mux transport config' should be 'map'"
        ))
    }
}
