use std::collections::BTreeMap;

use crate::error::{code, DriverError, ErrorDetail};
use crate::protocol::{StatementResult, WireReader};

const SUB_CODE_BITS: u32 = 24;
const PARAM_ADDRESS: &str = "address";
const PARAM_PARTITION_ID: &str = "partitionId";

/// Decode the structured error payload following a non-success result
///
/// A payload that ends early yields a protocol error rather than a
/// partially filled remote error.
pub fn read_remote_error(
    result: StatementResult,
    reader: &mut WireReader,
    address: &str,
    partition_id: i32,
    detail_message: bool,
) -> DriverError {
    match parse(result, reader, address, partition_id, detail_message) {
        Ok(e) => e,
        Err(e) => DriverError::protocol(format!(
            "Protocol error by invalid remote error message (result={}, address={}, reason={})",
            result,
            address,
            e.message()
        )),
    }
}

fn parse(
    result: StatementResult,
    reader: &mut WireReader,
    address: &str,
    partition_id: i32,
    detail_message: bool,
) -> Result<DriverError, DriverError> {
    let count = reader.get_i32()?;

    let mut top_code = 0;
    let mut top_message = String::new();
    let mut major_code = 0;
    let mut major_message: Option<String> = None;
    let mut message = String::new();

    for i in 0..count.max(0) {
        let entry_code = reader.get_i32()?;
        let entry_message = reader.get_string()?;
        let type_name = reader.get_string()?;
        let file_name = reader.get_string()?;
        let function_name = reader.get_string()?;
        let line = reader.get_i32()?;

        if i == 0 {
            top_code = entry_code;
            top_message = entry_message.clone();
        }

        let mut major_updated = false;
        if entry_code != 0 && !type_name.ends_with("PlatformException") {
            major_updated = true;
            major_code = entry_code;
        }

        if !detail_message {
            if !entry_message.is_empty() {
                if major_updated {
                    major_message = Some(entry_message);
                } else if major_code == 0 {
                    major_message = Some(format!("minorCode={} : {}", entry_code, entry_message));
                }
            }
            continue;
        }

        if i > 0 {
            message.push_str(" by ");
        }
        if type_name.is_empty() {
            message.push_str("(Unknown exception)");
        } else {
            message.push_str(&type_name);
        }
        if !file_name.is_empty() {
            message.push(' ');
            message.push_str(&file_name);
        }
        if !function_name.is_empty() {
            message.push(' ');
            message.push_str(&function_name);
        }
        if line > 0 {
            message.push_str(&format!(" line={}", line));
        }
        if entry_code != 0 {
            message.push_str(&format!(" code={}", entry_code));
        }
        if !entry_message.is_empty() {
            message.push_str(" : ");
            message.push_str(&entry_message);
        }
    }

    let mut name = None;
    if reader.has_remaining() {
        let error_name = reader.get_string()?;
        if !error_name.is_empty() {
            name = Some(error_name);
            major_code = top_code;
            major_message = Some(top_message);
        }
    }

    let mut parameters = BTreeMap::new();
    if reader.has_remaining() {
        let param_count = reader.get_i32()?;
        for _ in 0..param_count.max(0) {
            let key = reader.get_string()?;
            let value = reader.get_string()?;
            parameters.insert(key, value);
        }
    }

    if !detail_message {
        if let Some(major) = major_message {
            message.push_str(&major);
        }
    }
    if !message.is_empty() {
        message.push(' ');
    }
    let address = parameters
        .entry(PARAM_ADDRESS.to_string())
        .or_insert_with(|| address.to_string())
        .clone();
    let partition = parameters
        .entry(PARAM_PARTITION_ID.to_string())
        .or_insert_with(|| partition_id.to_string())
        .clone();
    message.push_str(&format!(
        "({}={}, {}={})",
        PARAM_ADDRESS, address, PARAM_PARTITION_ID, partition
    ));

    let sub_code = ((major_code as u32) >> SUB_CODE_BITS) as i32;
    let detail = |default_code: i32| ErrorDetail {
        code: main_code(major_code, default_code),
        sub_code,
        name: name.clone(),
        message: message.clone(),
        parameters: parameters.clone(),
    };

    Ok(match result {
        StatementResult::StatementError => DriverError::Statement(detail(code::BAD_STATEMENT)),
        StatementResult::Deny => DriverError::WrongNode(detail(code::WRONG_NODE)),
        _ => DriverError::Connection(detail(code::BAD_CONNECTION)),
    })
}

fn main_code(base: i32, default_code: i32) -> i32 {
    let code = base & ((1 << SUB_CODE_BITS) - 1);
    if code == 0 {
        default_code
    } else {
        code
    }
}
