//! `fetch` binding
//!
//! The request runs synchronously on the host network stack with whatever
//! is left of the run's budget as its timeout. Egress is not filtered.
//! A small script wraps the native call so user code sees a Promise of a
//! Response-like object.

use super::Host;
use boa_engine::object::{FunctionObjectBuilder, ObjectInitializer};
use boa_engine::property::Attribute;
use boa_engine::{
    Context, JsArgs, JsNativeError, JsObject, JsResult, JsString, JsValue, NativeFunction, Source,
    js_string,
};
use std::time::Instant;

const FETCH_WRAPPER: &str = r#"(function (hostFetch) {
  function wrap(raw) {
    var used = false;
    function body() {
      if (used) {
        return Promise.reject(new TypeError("body has already been consumed"));
      }
      used = true;
      return Promise.resolve(raw.body);
    }
    return {
      ok: raw.status >= 200 && raw.status < 300,
      status: raw.status,
      statusText: raw.statusText,
      url: raw.url,
      headers: raw.headers,
      text: function () { return body(); },
      json: function () { return body().then(function (t) { return JSON.parse(t); }); }
    };
  }
  return function fetch(input, init) {
    return new Promise(function (resolve, reject) {
      try {
        resolve(wrap(hostFetch(String(input), init === undefined ? null : init)));
      } catch (e) {
        reject(e);
      }
    });
  };
})"#;

pub(super) fn install(context: &mut Context, host: &Host) -> JsResult<()> {
    let factory = context.eval(Source::from_bytes(FETCH_WRAPPER))?;
    let factory = factory.as_callable().cloned().ok_or_else(|| {
        JsNativeError::typ().with_message("fetch wrapper did not evaluate to a function")
    })?;

    let native = FunctionObjectBuilder::new(
        context.realm(),
        NativeFunction::from_copy_closure_with_captures(host_fetch, host.clone()),
    )
    .name(js_string!("fetch"))
    .length(2)
    .build();

    let fetch = factory.call(&JsValue::undefined(), &[native.into()], context)?;
    context.register_global_property(
        js_string!("fetch"),
        fetch,
        Attribute::WRITABLE | Attribute::CONFIGURABLE,
    )
}

struct Request {
    url: String,
    method: String,
    headers: Vec<(String, String)>,
    body: Option<String>,
}

fn host_fetch(_: &JsValue, args: &[JsValue], host: &Host, context: &mut Context) -> JsResult<JsValue> {
    if host.run.cancelled() {
        return Err(refused());
    }

    let request = read_request(args, host, context)?;
    let remaining = host.run.deadline.saturating_duration_since(Instant::now());
    tracing::debug!(url = %request.url, method = %request.method, ?remaining, "sandbox fetch");

    let response = send(&request, remaining).map_err(|e| {
        JsNativeError::typ().with_message(format!("fetch failed: {e}"))
    })?;

    // the run may have been cancelled while the request was in flight
    if host.run.cancelled() {
        return Err(refused());
    }

    let headers = {
        let mut init = ObjectInitializer::new(context);
        for (name, value) in &response.headers {
            init.property(
                JsString::from(name.as_str()),
                JsString::from(value.as_str()),
                Attribute::all(),
            );
        }
        init.build()
    };

    let raw = ObjectInitializer::new(context)
        .property(js_string!("status"), i32::from(response.status), Attribute::all())
        .property(
            js_string!("statusText"),
            JsString::from(response.status_text.as_str()),
            Attribute::all(),
        )
        .property(js_string!("url"), JsString::from(response.url.as_str()), Attribute::all())
        .property(js_string!("headers"), headers, Attribute::all())
        .property(js_string!("body"), JsString::from(response.body.as_str()), Attribute::all())
        .build();
    Ok(raw.into())
}

fn read_request(args: &[JsValue], host: &Host, context: &mut Context) -> JsResult<Request> {
    let url = args
        .get_or_undefined(0)
        .to_string(context)?
        .to_std_string_escaped();

    let mut request = Request {
        url,
        method: "GET".into(),
        headers: Vec::new(),
        body: None,
    };

    let Some(init) = args.get_or_undefined(1).as_object().cloned() else {
        return Ok(request);
    };

    let method = init.get(js_string!("method"), context)?;
    if !method.is_undefined() && !method.is_null() {
        request.method = method.to_string(context)?.to_std_string_escaped().to_uppercase();
    }

    let body = init.get(js_string!("body"), context)?;
    if !body.is_undefined() && !body.is_null() {
        request.body = Some(body.to_string(context)?.to_std_string_escaped());
    }

    let headers = init.get(js_string!("headers"), context)?;
    if let Some(headers) = headers.as_object().cloned() {
        request.headers = read_headers(&headers, &host.object_keys, context)?;
    }

    Ok(request)
}

#[allow(clippy::cast_possible_truncation)]
fn read_headers(
    headers: &JsObject,
    object_keys: &JsObject,
    context: &mut Context,
) -> JsResult<Vec<(String, String)>> {
    let keys = object_keys.call(&JsValue::undefined(), &[headers.clone().into()], context)?;
    let Some(keys) = keys.as_object().cloned() else {
        return Ok(Vec::new());
    };
    let len = keys.get(js_string!("length"), context)?.to_length(context)?;

    let mut out = Vec::with_capacity(len as usize);
    for i in 0..len {
        let name = keys.get(i as u32, context)?.to_string(context)?;
        let value = headers.get(name.clone(), context)?.to_string(context)?;
        out.push((name.to_std_string_escaped(), value.to_std_string_escaped()));
    }
    Ok(out)
}

struct Response {
    status: u16,
    status_text: String,
    url: String,
    headers: Vec<(String, String)>,
    body: String,
}

fn send(request: &Request, timeout: std::time::Duration) -> Result<Response, reqwest::Error> {
    let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .unwrap_or(reqwest::Method::GET);

    let mut builder = client.request(method, &request.url);
    for (name, value) in &request.headers {
        builder = builder.header(name, value);
    }
    if let Some(body) = &request.body {
        builder = builder.body(body.clone());
    }

    let response = builder.send()?;
    let status = response.status();
    let url = response.url().to_string();
    let headers = response
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
        .collect();
    let body = response.text()?;

    Ok(Response {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_string(),
        url,
        headers,
        body,
    })
}

fn refused() -> boa_engine::JsError {
    JsNativeError::typ()
        .with_message("network access refused: run cancelled")
        .into()
}

#[cfg(test)]
mod tests {
    use crate::capture::Capture;
    use crate::config::SandboxConfig;
    use crate::sandbox::{Evaluation, Sandbox};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn sandbox(deadline: Instant) -> (Sandbox, Arc<Capture>) {
        let config = SandboxConfig::builder().allow_network(true).build();
        let capture = Arc::new(Capture::new(100, None));
        let sandbox = Sandbox::new(&config, Arc::clone(&capture), deadline).unwrap();
        (sandbox, capture)
    }

    #[test]
    fn fetch_is_exposed_when_network_is_allowed() {
        let (mut sandbox, _) = sandbox(Instant::now() + Duration::from_secs(5));
        assert!(matches!(
            sandbox.evaluate("typeof fetch"),
            Evaluation::Completed(v) if v == serde_json::json!("function")
        ));
    }

    #[test]
    fn fetch_after_cancellation_rejects() {
        let (mut sandbox, capture) = sandbox(Instant::now() + Duration::from_secs(5));
        capture.seal();
        // sealed capture also swallows the log, so inspect the promise state instead
        let evaluation = sandbox.evaluate(
            "var state = 'pending';\
             fetch('http://127.0.0.1:9/').then(function () { state = 'ok'; }, function (e) { state = e.message; });\
             state",
        );
        assert!(matches!(evaluation, Evaluation::Completed(v) if v == serde_json::json!("pending")));
        assert!(matches!(
            sandbox.evaluate("state"),
            Evaluation::Completed(v) if v == serde_json::json!("network access refused: run cancelled")
        ));
    }

    #[test]
    fn connection_errors_reject_with_type_error() {
        let (mut sandbox, capture) = sandbox(Instant::now() + Duration::from_secs(5));
        let evaluation = sandbox.evaluate(
            "fetch('http://127.0.0.1:9/').catch(function (e) { console.error(e.name); })",
        );
        assert!(matches!(evaluation, Evaluation::Completed(_)));
        let entries = capture.seal();
        assert_eq!(entries[0].content, "TypeError");
    }
}
