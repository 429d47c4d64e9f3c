//! 命令序列化
//!
//! 线上格式是一个 JSON 对象：命令字段在前，`__cmd_name__` 在最后，
//! 例如 `{"x":2,"y":[1,2,3],"__cmd_name__":"my_command"}`。

use crate::command::{AnyCommand, Command};
use curium_common::SerializationError;
use serde_json::{Map, Value};
use std::any::{TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use tracing::debug;

/// 命令名称字段
pub const CMD_NAME_KEY: &str = "__cmd_name__";

type DecodeFn = fn(Value) -> serde_json::Result<Box<dyn AnyCommand>>;

/// 注册表中的一个命令类型
#[derive(Clone, Copy)]
pub struct CommandEntry {
    name: &'static str,
    type_id: TypeId,
    type_name: &'static str,
    decode: DecodeFn,
}

impl CommandEntry {
    pub fn of<C: Command>() -> Self {
        Self {
            name: C::NAME,
            type_id: TypeId::of::<C>(),
            type_name: type_name::<C>(),
            decode: decode_command::<C>,
        }
    }
}

impl fmt::Debug for CommandEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandEntry")
            .field("name", &self.name)
            .field("type_name", &self.type_name)
            .finish()
    }
}

fn decode_command<C: Command>(fields: Value) -> serde_json::Result<Box<dyn AnyCommand>> {
    // 单元结构体编码为 `{}`，解码时需要从 null 还原
    let empty = fields.as_object().is_some_and(Map::is_empty);
    match serde_json::from_value::<C>(fields) {
        Ok(cmd) => Ok(Box::new(cmd)),
        Err(e) if empty => serde_json::from_value::<C>(Value::Null)
            .map(|cmd| Box::new(cmd) as Box<dyn AnyCommand>)
            .map_err(|_| e),
        Err(e) => Err(e),
    }
}

/// 序列化器接口
pub trait Serializer: Send + Sync + 'static {
    /// 把命令编码为线上格式的 JSON 对象
    fn to_value(&self, cmd: &dyn AnyCommand) -> Result<Value, SerializationError>;

    /// 把命令编码为字节
    fn serialize(&self, cmd: &dyn AnyCommand) -> Result<Vec<u8>, SerializationError>;

    /// 从字节解码命令
    fn deserialize(&self, data: &[u8]) -> Result<Box<dyn AnyCommand>, SerializationError>;

    /// 从已经解析的 JSON 对象解码命令
    fn deserialize_value(&self, value: Value) -> Result<Box<dyn AnyCommand>, SerializationError>;

    /// 注册命令类型
    ///
    /// 重复注册同一个类型不会报错；不同类型使用相同名称时返回 `CommandHasRegistered`
    fn register(&self, entry: CommandEntry) -> Result<(), SerializationError>;

    fn is_registered(&self, name: &str) -> bool;
}

impl dyn Serializer {
    pub fn register_cmd<C: Command>(&self) -> Result<(), SerializationError> {
        self.register(CommandEntry::of::<C>())
    }
}

/// JSON 序列化器
#[derive(Default)]
pub struct JsonSerializer {
    registry: RwLock<HashMap<&'static str, CommandEntry>>,
}

impl JsonSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_cmd<C: Command>(&self) -> Result<(), SerializationError> {
        self.register(CommandEntry::of::<C>())
    }

    fn lookup(&self, name: &str) -> Option<CommandEntry> {
        let registry = self
            .registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registry.get(name).copied()
    }
}

impl fmt::Debug for JsonSerializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self
            .registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut names: Vec<_> = registry.keys().collect();
        names.sort();
        f.debug_struct("JsonSerializer")
            .field("commands", &names)
            .finish()
    }
}

impl Serializer for JsonSerializer {
    fn to_value(&self, cmd: &dyn AnyCommand) -> Result<Value, SerializationError> {
        let fields = cmd.to_value().map_err(|e| {
            SerializationError::unsupported(format!("cannot encode command {}: {e}", cmd.name()))
        })?;

        let mut object = match fields {
            Value::Object(object) => object,
            Value::Null => Map::new(),
            other => {
                return Err(SerializationError::unsupported(format!(
                    "command {} must be encoded as a JSON object, got {other}",
                    cmd.name()
                )));
            }
        };
        object.insert(
            CMD_NAME_KEY.to_string(),
            Value::String(cmd.name().to_string()),
        );
        Ok(Value::Object(object))
    }

    fn serialize(&self, cmd: &dyn AnyCommand) -> Result<Vec<u8>, SerializationError> {
        let value = self.to_value(cmd)?;
        serde_json::to_vec(&value).map_err(|e| SerializationError::unsupported(e.to_string()))
    }

    fn deserialize(&self, data: &[u8]) -> Result<Box<dyn AnyCommand>, SerializationError> {
        let value: Value = serde_json::from_slice(data).map_err(|e| {
            SerializationError::invalid_format(format!(
                "{} is not valid JSON: {e}",
                String::from_utf8_lossy(data)
            ))
        })?;
        self.deserialize_value(value)
    }

    fn deserialize_value(&self, value: Value) -> Result<Box<dyn AnyCommand>, SerializationError> {
        let mut object = match value {
            Value::Object(object) => object,
            other => {
                return Err(SerializationError::invalid_format(format!(
                    "{other} is not a JSON object"
                )));
            }
        };

        let name = match object.get(CMD_NAME_KEY) {
            Some(Value::String(name)) => name.clone(),
            Some(other) => {
                return Err(SerializationError::invalid_format(format!(
                    "{CMD_NAME_KEY} should be a string, got {other}"
                )));
            }
            None => {
                return Err(SerializationError::invalid_format(format!(
                    "{} does not contain {CMD_NAME_KEY}",
                    Value::Object(object)
                )));
            }
        };
        object.remove(CMD_NAME_KEY);

        let entry = self
            .lookup(&name)
            .ok_or_else(|| SerializationError::not_registered(&name))?;

        (entry.decode)(Value::Object(object)).map_err(|e| {
            SerializationError::invalid_format(format!("invalid fields of command {name}: {e}"))
        })
    }

    fn register(&self, entry: CommandEntry) -> Result<(), SerializationError> {
        let mut registry = self
            .registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(registered) = registry.get(entry.name) {
            if registered.type_id == entry.type_id {
                return Ok(());
            }
            return Err(SerializationError::CommandHasRegistered {
                command: entry.type_name.to_string(),
                registered: registered.type_name.to_string(),
            });
        }

        debug!("Registered command {} ({})", entry.name, entry.type_name);
        registry.insert(entry.name, entry);
        Ok(())
    }

    fn is_registered(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }
}
