//! `brickwire call`: invoke one function of one device.

use brickwire_protocol::{Format, Uid, Value};

use crate::config::ClientConfig;
use crate::device::{Device, ResponseExpected};
use crate::error::{ClientError, ClientResult};

/// Arguments of a single call.
#[derive(Debug, Clone)]
pub struct CallArgs {
    pub uid: String,
    pub function_id: u8,
    pub request_format: String,
    pub args: Vec<String>,
    pub response_format: String,
    pub no_response: bool,
    pub json: bool,
}

/// Sends the request and prints the decoded response.
pub async fn run(config: &ClientConfig, call: CallArgs) -> ClientResult<()> {
    let uid: Uid = call.uid.parse()?;
    let request_format = Format::parse(&call.request_format)?;
    let response_format = Format::parse(&call.response_format)?;
    let values = parse_args(&request_format, &call.args)?;

    let connection = super::connect(config).await?;
    let device = Device::new(uid, &connection);
    if call.no_response {
        device.declare(call.function_id, ResponseExpected::False);
    }

    let result = device
        .send_request(call.function_id, &values, &request_format, &response_format)
        .await;
    let _ = connection.disconnect().await;
    let response = result?;

    if call.json {
        let line = serde_json::to_string(&response)
            .map_err(|e| ClientError::invalid_argument(format!("failed to encode response: {e}")))?;
        println!("{line}");
    } else {
        for value in &response {
            println!("{value}");
        }
    }
    Ok(())
}

/// Parses one command-line argument per format field.
pub fn parse_args(format: &Format, args: &[String]) -> ClientResult<Vec<Value>> {
    if format.fields().len() != args.len() {
        return Err(ClientError::invalid_argument(format!(
            "format `{format}` takes {} values, got {}",
            format.fields().len(),
            args.len()
        )));
    }

    format
        .fields()
        .iter()
        .zip(args)
        .map(|(field, arg)| field.parse_value(arg).map_err(ClientError::from))
        .collect()
}
