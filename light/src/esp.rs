use core::convert::TryInto;
use std::{
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Method, Status},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    gpio::{AnyIOPin, AnyOutputPin, Input, PinDriver, Pull},
    ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution, LEDC, TIMER0},
    units::Hertz,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mdns::EspMdns,
    nvs::{EspDefaultNvsPartition, EspNvs},
    sys::EspError,
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};
use serde::Serialize;

use onair_common::{
    config::{provisioning_ssid, ConfigView, NetworkConfig, OutputConfig},
    feed::MAX_FEED_BODY_BYTES,
    feed_url,
    output::CHANNEL_COUNT,
    parse_snapshot, ConfigUpdate, FeedError, FetchOutcome, LightEngine, Millis, PollTimer,
    RuntimeConfig, ScheduleEvent, Snapshot,
};

const NVS_NAMESPACE: &str = "onair";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const MAX_HTTP_BODY: usize = 4096;
const FETCH_TIMEOUT_SECS: u64 = 10;
const FETCH_CHUNK_SIZE: usize = 512;
const LOOP_INTERVAL_MS: u64 = 20;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_RESTART_GRACE_MS: u64 = 300_000;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const BUTTON_DEBOUNCE_MS: u64 = 50;
const FALLBACK_AP_SSID: &str = "OnAir-SETUP";

const SETUP_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>OnAir Light</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:640px;margin:2rem auto;padding:0 1rem;color:#111}
    .card{border:1px solid #ddd;border-radius:8px;padding:1rem}
    label{display:block;margin:.5rem 0 .2rem}input{width:100%;padding:.5rem;box-sizing:border-box}
    .row{display:flex;gap:1rem}.row>div{flex:1}.muted{color:#555}.ok{color:#106010}.err{color:#a00000}
    button{padding:.55rem .9rem;margin-top:.8rem}
  </style>
</head>
<body>
  <h1>OnAir Light</h1>
  <p class="muted" id="active"></p>
  <div class="card">
    <label>WiFi SSID</label><input id="wifiSsid" type="text">
    <label>WiFi Password (leave blank to keep current)</label><input id="wifiPass" type="password">
    <label>Hostname</label><input id="hostname" type="text">
    <label>Feed Base URL</label><input id="baseUrl" type="text">
    <label>Calendar URL</label><input id="feedPath" type="text">
    <div class="row">
      <div><label>Free %</label><input id="brightnessFree" type="number" min="0" max="100"></div>
      <div><label>Coffee %</label><input id="brightnessCoffee" type="number" min="0" max="100"></div>
      <div><label>Meeting %</label><input id="brightnessMeeting" type="number" min="0" max="100"></div>
      <div><label>Recording %</label><input id="brightnessRecording" type="number" min="0" max="100"></div>
    </div>
    <button id="save">Save</button>
    <button id="restart">Restart Device</button>
    <div id="status" class="muted"></div>
  </div>
  <script>
    const q=(id)=>document.getElementById(id);
    const text=['wifiSsid','hostname','baseUrl','feedPath'];
    const nums=['brightnessFree','brightnessCoffee','brightnessMeeting','brightnessRecording'];
    async function api(path,opt){const r=await fetch(path,opt);let b={};try{b=await r.json();}catch(_){}if(!r.ok)throw new Error(b.error||('Request failed: '+r.status));return b;}
    const show=(cls,msg)=>{q('status').className=cls;q('status').textContent=msg;};
    async function load(){
      const c=await api('/api/config');
      text.forEach((k)=>q(k).value=c[k]||'');
      nums.forEach((k)=>q(k).value=c[k]);
      api('/api/status').then((s)=>q('active').textContent='Showing: '+s.active).catch(()=>{});
    }
    q('save').addEventListener('click', async ()=>{
      show('muted','Saving...');
      try{
        const payload={};
        text.forEach((k)=>{const v=q(k).value.trim();if(v)payload[k]=v;});
        nums.forEach((k)=>payload[k]=Number(q(k).value));
        if(q('wifiPass').value)payload.wifiPass=q('wifiPass').value;
        const res=await api('/api/config',{method:'PUT',headers:{'content-type':'application/json'},body:JSON.stringify(payload)});
        show('ok','Saved. restartRequired='+String(!!res.restartRequired));
        q('wifiPass').value='';
      }catch(err){show('err',err.message);}
    });
    q('restart').addEventListener('click', async ()=>{
      show('muted','Restarting...');
      try{await api('/api/restart',{method:'POST'});show('ok','Restart requested.');}
      catch(err){show('err',err.message);}
    });
    load().catch((err)=>show('err',err.message));
  </script>
</body>
</html>
"#;

enum WifiStartup {
    Connected(EspWifi<'static>),
    Provisioning(EspWifi<'static>),
}

#[derive(Clone)]
struct SharedState {
    engine: Arc<Mutex<LightEngine>>,
    runtime: Arc<Mutex<RuntimeConfig>>,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

struct LedOutput {
    _timer: LedcTimerDriver<'static, TIMER0>,
    channels: [LedcDriver<'static>; CHANNEL_COUNT],
}

struct ResetButton {
    pin: PinDriver<'static, AnyIOPin, Input>,
    low_since_ms: Option<u64>,
    fired: bool,
}

#[derive(Debug, Serialize)]
struct ConfigUpdateResponse {
    #[serde(rename = "restartRequired")]
    restart_required: bool,
    config: ConfigView,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    ensure_wifi_defaults(&mut runtime);

    info!(
        "NVS config loaded: ssid=`{}`, hostname=`{}`, feed configured={}",
        runtime.network.wifi_ssid,
        runtime.network.hostname,
        runtime.feed.is_configured(),
    );

    let Peripherals { modem, ledc, .. } = Peripherals::take()?;

    let mut leds =
        LedOutput::new(ledc, &runtime.output).context("failed to initialize LED outputs")?;
    if let Err(err) = leds.write_half() {
        warn!("failed to set boot LED level: {err:#}");
    }
    info!(
        "LED PWM ready on GPIO {:?} @ {}Hz",
        runtime.output.led_pins, runtime.output.pwm_frequency_hz
    );

    let mut reset_button = match ResetButton::new(runtime.reset_button_pin) {
        Ok(button) => Some(button),
        Err(err) => {
            warn!(
                "reset button unavailable on GPIO{}: {err:#}",
                runtime.reset_button_pin
            );
            None
        }
    };

    let wifi = match connect_wifi(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?
    {
        WifiStartup::Connected(wifi) => {
            info!("wifi connected");
            wifi
        }
        WifiStartup::Provisioning(wifi) => {
            let server = create_provisioning_http_server(nvs_store.clone())?;

            let _wifi = wifi;
            let _server = server;
            loop {
                thread::sleep(Duration::from_secs(60));
            }
        }
    };
    disable_wifi_power_save();

    let _mdns = match start_mdns(&runtime.network.hostname) {
        Ok(mdns) => {
            info!("mdns started as `{}.local`", runtime.network.hostname);
            Some(mdns)
        }
        Err(err) => {
            warn!("mdns failed: {err:#}");
            None
        }
    };

    let watchdog = TaskWatchdog::subscribe(WATCHDOG_TIMEOUT_SEC)?;

    if !runtime.feed.is_configured() {
        warn!("feed path not configured; open the setup page to set it");
    }

    let shared_state = SharedState {
        engine: Arc::new(Mutex::new(LightEngine::new(
            runtime.brightness,
            PollTimer::default(),
        ))),
        runtime: Arc::new(Mutex::new(runtime)),
    };

    // Keep the server alive for the program lifetime.
    let _server = create_http_server(shared_state.clone(), nvs_store.clone())?;
    let _wifi = wifi;

    run_light_loop(&shared_state, &nvs_store, &watchdog, &mut leds, &mut reset_button)
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
}

// Fetch, advance and render all happen on this thread, one after another.
fn run_light_loop(
    state: &SharedState,
    nvs_store: &NvsStore,
    watchdog: &TaskWatchdog,
    leds: &mut LedOutput,
    reset_button: &mut Option<ResetButton>,
) -> ! {
    let max_duty = leds.max_duty();
    let mut link = LinkMonitor::default();

    loop {
        watchdog.feed();
        let now_ms = monotonic_ms();
        let wifi_connected = station_link_up();

        if link.down_for_ms(wifi_connected, now_ms) >= WIFI_RESTART_GRACE_MS {
            warn!(
                "wifi down for {}s; restarting to recover",
                WIFI_RESTART_GRACE_MS / 1000
            );
            thread::sleep(Duration::from_millis(100));
            restart_now();
        }

        if reset_button
            .as_mut()
            .is_some_and(|button| button.pressed(now_ms))
        {
            factory_reset(state, nvs_store);
        }

        let poll_due = lock(&state.engine).poll_due(clock_now(), wifi_connected);
        if poll_due {
            update_feed(state);
        }

        let now = clock_now();
        let (events, duties) = {
            let mut engine = lock(&state.engine);
            let events = engine.tick(now);
            (events, engine.render(max_duty))
        };

        log_schedule_events(&events);
        if let Some(duties) = duties {
            match leds.write(duties) {
                Ok(()) => info!("LED output -> {duties:?}"),
                Err(err) => {
                    warn!("failed to drive LEDs: {err:#}");
                    lock(&state.engine).invalidate_output();
                }
            }
        }

        thread::sleep(Duration::from_millis(LOOP_INTERVAL_MS));
    }
}

fn update_feed(state: &SharedState) {
    let url = {
        let runtime = lock(&state.runtime);
        if !runtime.feed.is_configured() {
            return;
        }
        feed_url(&runtime.feed.base_url, &runtime.feed.feed_path)
    };

    debug!("updating feed from {url}");
    let result = fetch_feed(&url);
    let now = clock_now();

    if let Err(err) = &result {
        warn!("feed update failed, keeping previous schedule: {err}");
    }

    let outcome = lock(&state.engine).apply_fetch(result, now);
    if let FetchOutcome::Applied { current, next } = outcome {
        info!(
            "feed updated: current={} next={}",
            current.as_str(),
            next.as_str()
        );
    }
}

fn fetch_feed(url: &str) -> Result<Snapshot, FeedError> {
    let http_conf = HttpClientConfiguration {
        timeout: Some(Duration::from_secs(FETCH_TIMEOUT_SECS)),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    let connection = EspHttpConnection::new(&http_conf).map_err(transport_error)?;
    let mut client = HttpClient::wrap(connection);
    let request = client
        .request(Method::Get, url, &[("accept", "application/json")])
        .map_err(transport_error)?;
    let mut response = request.submit().map_err(transport_error)?;

    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(FeedError::Status(status));
    }

    let mut body = Vec::new();
    let mut chunk = [0_u8; FETCH_CHUNK_SIZE];
    loop {
        let read = response.read(&mut chunk).map_err(transport_error)?;
        if read == 0 {
            break;
        }
        if body.len() + read > MAX_FEED_BODY_BYTES {
            return Err(FeedError::BodyTooLarge);
        }
        body.extend_from_slice(&chunk[..read]);
    }

    parse_snapshot(&body)
}

fn transport_error<E: core::fmt::Debug>(err: E) -> FeedError {
    FeedError::Transport(format!("{err:?}"))
}

fn log_schedule_events(events: &[ScheduleEvent]) {
    for event in events {
        match event {
            ScheduleEvent::CurrentExpired(category) => {
                info!("current {} event ended", category.as_str())
            }
            ScheduleEvent::NextPromoted(category) => {
                info!("next {} event started", category.as_str())
            }
            ScheduleEvent::NextDiscarded(category) => {
                info!("next {} event elapsed before it was seen", category.as_str())
            }
        }
    }
}

fn factory_reset(state: &SharedState, nvs_store: &NvsStore) {
    warn!("reset button pressed; clearing wifi credentials");
    let mut runtime = lock(&state.runtime).clone();
    runtime.network.forget_credentials();
    if let Err(err) = nvs_store.save_runtime_config(&runtime) {
        warn!("failed to clear wifi credentials: {err:#}");
        return;
    }
    thread::sleep(Duration::from_millis(100));
    restart_now();
}

fn create_http_server(
    state: SharedState,
    nvs_store: NvsStore,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
        req.into_ok_response()?.write_all(SETUP_HTML.as_bytes())?;
        Ok(())
    })?;

    {
        let state = state.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            let status = lock(&state.engine).status(clock_now());
            respond(req, 200, &status)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/config", Method::Get, move |req| {
            let view = lock(&state.runtime).view();
            respond(req, 200, &view)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/config", Method::Put, move |mut req| {
            let body = read_request_body(&mut req)?;
            let update: ConfigUpdate = match serde_json::from_slice(&body) {
                Ok(update) => update,
                Err(err) => {
                    let message = format!("invalid config payload: {err}");
                    return respond(req, 400, &error_body(&message));
                }
            };

            let mut runtime = lock(&state.runtime);
            let mut updated = runtime.clone();
            let outcome = match updated.apply_update(update) {
                Ok(outcome) => outcome,
                Err(err) => return respond(req, 400, &error_body(&err.to_string())),
            };

            if let Err(err) = nvs_store.save_runtime_config(&updated) {
                warn!("failed to persist runtime config: {err:#}");
                return respond(req, 500, &error_body("failed to save config"));
            }
            *runtime = updated;

            {
                let mut engine = lock(&state.engine);
                engine.set_brightness(runtime.brightness);
                if outcome.feed_changed {
                    engine.request_refresh();
                }
            }

            info!(
                "config saved (restart required: {})",
                outcome.restart_required
            );
            let payload = ConfigUpdateResponse {
                restart_required: outcome.restart_required,
                config: runtime.view(),
            };
            drop(runtime);
            respond(req, 200, &payload)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/refresh", Method::Post, move |req| {
            lock(&state.engine).request_refresh();
            let payload = serde_json::json!({ "refreshing": true });
            respond(req, 200, &payload)
        })?;
    }

    server.fn_handler("/api/restart", Method::Post, move |req| {
        schedule_restart(Duration::from_millis(500));
        let payload = serde_json::json!({ "restarting": true });
        respond(req, 200, &payload)
    })?;

    Ok(server)
}

fn create_provisioning_http_server(nvs_store: NvsStore) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    for path in [
        "/",
        "/generate_204",
        "/gen_204",
        "/hotspot-detect.html",
        "/connecttest.txt",
        "/ncsi.txt",
        "/fwlink",
    ] {
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            req.into_ok_response()?.write_all(SETUP_HTML.as_bytes())?;
            Ok(())
        })?;
    }

    {
        let nvs_store = nvs_store.clone();
        server.fn_handler("/api/config", Method::Get, move |req| {
            let runtime = nvs_store.load_runtime_config().unwrap_or_default();
            respond(req, 200, &runtime.view())
        })?;
    }

    {
        let nvs_store = nvs_store.clone();
        server.fn_handler::<anyhow::Error, _>("/api/config", Method::Put, move |mut req| {
            let body = read_request_body(&mut req)?;
            let update: ConfigUpdate = match serde_json::from_slice(&body) {
                Ok(update) => update,
                Err(err) => {
                    let message = format!("invalid config payload: {err}");
                    return respond(req, 400, &error_body(&message));
                }
            };

            let mut runtime = nvs_store.load_runtime_config().unwrap_or_default();
            let outcome = match runtime.apply_update(update) {
                Ok(outcome) => outcome,
                Err(err) => return respond(req, 400, &error_body(&err.to_string())),
            };
            nvs_store.save_runtime_config(&runtime)?;
            info!("provisioning config saved; restarting to join `{}`", runtime.network.wifi_ssid);

            // Leave provisioning as soon as the response is out.
            schedule_restart(Duration::from_secs(3));
            let payload = ConfigUpdateResponse {
                restart_required: outcome.restart_required,
                config: runtime.view(),
            };
            respond(req, 200, &payload)
        })?;
    }

    server.fn_handler("/api/status", Method::Get, move |req| {
        respond(req, 409, &error_body("Device is in provisioning mode"))
    })?;

    server.fn_handler("/api/restart", Method::Post, move |req| {
        schedule_restart(Duration::from_millis(500));
        let payload = serde_json::json!({ "restarting": true });
        respond(req, 200, &payload)
    })?;

    Ok(server)
}

type HttpRequest<'a, 'c> =
    esp_idf_svc::http::server::Request<&'a mut esp_idf_svc::http::server::EspHttpConnection<'c>>;

fn read_request_body(req: &mut HttpRequest<'_, '_>) -> anyhow::Result<Vec<u8>> {
    let len = usize::try_from(req.content_len().unwrap_or(0))?;
    anyhow::ensure!(len <= MAX_HTTP_BODY, "request body exceeds {MAX_HTTP_BODY} bytes");

    let mut body = vec![0_u8; len];
    req.read_exact(&mut body)?;
    Ok(body)
}

fn respond<T: Serialize>(req: HttpRequest<'_, '_>, status: u16, payload: &T) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    let mut response =
        req.into_response(status, None, &[("Content-Type", "application/json; charset=utf-8")])?;
    response.write_all(&body)?;
    Ok(())
}

fn error_body(message: &str) -> serde_json::Value {
    serde_json::json!({ "error": message })
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<WifiStartup> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let ap_ssid = match esp_wifi.sta_netif().get_mac() {
        Ok(mac) => provisioning_ssid(mac),
        Err(err) => {
            warn!("failed to read station MAC ({err}); using fallback AP name");
            FALLBACK_AP_SSID.to_string()
        }
    };

    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    if !network.has_station_credentials() {
        warn!("wifi credentials missing; entering provisioning AP mode");
        start_provisioning_ap(&mut wifi, &ap_ssid)?;
        return Ok(WifiStartup::Provisioning(esp_wifi));
    }

    wifi.set_configuration(&station_configuration(network)?)?;
    wifi.start()?;

    match join_station(&mut wifi, &network.wifi_ssid) {
        Ok(()) => Ok(WifiStartup::Connected(esp_wifi)),
        Err(err) => {
            warn!("giving up on `{}`: {err}", network.wifi_ssid);
            let _ = wifi.disconnect();
            let _ = wifi.stop();
            start_provisioning_ap(&mut wifi, &ap_ssid)?;
            Ok(WifiStartup::Provisioning(esp_wifi))
        }
    }
}

fn station_configuration(network: &NetworkConfig) -> anyhow::Result<Configuration> {
    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };
    Ok(Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))
}

/// Tries the station connection a fixed number of times and returns the last
/// error once they are used up.
fn join_station(wifi: &mut BlockingWifi<&mut EspWifi<'static>>, ssid: &str) -> Result<(), EspError> {
    let mut attempt = 1;
    loop {
        info!("joining `{ssid}` ({attempt}/{WIFI_CONNECT_ATTEMPTS})");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("joined `{ssid}`");
                return Ok(());
            }
            Err(err) if attempt < WIFI_CONNECT_ATTEMPTS => {
                warn!("join attempt {attempt} failed: {err}");
                let _ = wifi.disconnect();
                thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn start_provisioning_ap(
    wifi: &mut BlockingWifi<&mut EspWifi<'static>>,
    ssid: &str,
) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: ssid
            .try_into()
            .map_err(|_| anyhow!("provisioning AP SSID too long"))?,
        auth_method: AuthMethod::None,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!("provisioning AP started on `{ssid}`");
    Ok(())
}

fn start_mdns(hostname: &str) -> anyhow::Result<EspMdns> {
    let mut mdns = EspMdns::take()?;
    mdns.set_hostname(hostname)?;
    mdns.set_instance_name("OnAir light")?;
    mdns.add_service(None, "_http", "_tcp", 80, &[])?;
    Ok(mdns)
}

impl LedOutput {
    fn new(ledc: LEDC, output: &OutputConfig) -> anyhow::Result<Self> {
        let timer = LedcTimerDriver::new(
            ledc.timer0,
            &TimerConfig::new()
                .frequency(Hertz(output.pwm_frequency_hz))
                .resolution(Resolution::Bits10),
        )?;

        let [free, coffee, meeting, recording] = output.led_pins;
        let channels = unsafe {
            [
                LedcDriver::new(ledc.channel0, &timer, AnyOutputPin::new(free))?,
                LedcDriver::new(ledc.channel1, &timer, AnyOutputPin::new(coffee))?,
                LedcDriver::new(ledc.channel2, &timer, AnyOutputPin::new(meeting))?,
                LedcDriver::new(ledc.channel3, &timer, AnyOutputPin::new(recording))?,
            ]
        };

        Ok(Self {
            _timer: timer,
            channels,
        })
    }

    fn max_duty(&self) -> u32 {
        self.channels[0].get_max_duty()
    }

    fn write(&mut self, duties: [u32; CHANNEL_COUNT]) -> anyhow::Result<()> {
        for (channel, duty) in self.channels.iter_mut().zip(duties) {
            channel.set_duty(duty)?;
        }
        Ok(())
    }

    fn write_half(&mut self) -> anyhow::Result<()> {
        let half = self.max_duty() / 2;
        self.write([half; CHANNEL_COUNT])
    }
}

impl ResetButton {
    fn new(pin: i32) -> anyhow::Result<Self> {
        let mut pin = PinDriver::input(unsafe { AnyIOPin::new(pin) })?;
        pin.set_pull(Pull::Up)?;
        Ok(Self {
            pin,
            low_since_ms: None,
            fired: false,
        })
    }

    /// Active low; reports one press per hold once it has been low for the
    /// debounce window.
    fn pressed(&mut self, now_ms: u64) -> bool {
        if self.pin.is_high() {
            self.low_since_ms = None;
            self.fired = false;
            return false;
        }

        let since = *self.low_since_ms.get_or_insert(now_ms);
        if !self.fired && now_ms.saturating_sub(since) >= BUTTON_DEBOUNCE_MS {
            self.fired = true;
            return true;
        }
        false
    }
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = lock(&self.lock);
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => {
                let mut runtime = serde_json::from_str::<RuntimeConfig>(value)?;
                runtime.sanitize();
                Ok(runtime)
            }
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = lock(&self.lock);
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(runtime)?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)?;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn schedule_restart(delay: Duration) {
    let spawned = thread::Builder::new()
        .name("restart-request".into())
        .spawn(move || {
            thread::sleep(delay);
            restart_now();
        });
    if let Err(err) = spawned {
        warn!("failed to spawn restart thread ({err}); restarting now");
        restart_now();
    }
}

fn restart_now() {
    unsafe { esp_idf_svc::sys::esp_restart() };
}

/// Task watchdog subscription for the thread that created it.
struct TaskWatchdog;

impl TaskWatchdog {
    fn subscribe(timeout_sec: u32) -> anyhow::Result<Self> {
        let config = esp_idf_svc::sys::esp_task_wdt_config_t {
            timeout_ms: timeout_sec.saturating_mul(1000),
            idle_core_mask: 0,
            trigger_panic: true,
        };
        // Already initialised or subscribed both count as success.
        tolerate_invalid_state(unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) })
            .context("esp_task_wdt_init")?;
        tolerate_invalid_state(unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) })
            .context("esp_task_wdt_add")?;
        Ok(Self)
    }

    fn feed(&self) {
        let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
    }
}

fn tolerate_invalid_state(rc: esp_idf_svc::sys::esp_err_t) -> Result<(), EspError> {
    if rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    esp_idf_svc::sys::esp!(rc)
}

/// Tracks how long the station link has been down.
#[derive(Default)]
struct LinkMonitor {
    down_since_ms: Option<u64>,
}

impl LinkMonitor {
    fn down_for_ms(&mut self, connected: bool, now_ms: u64) -> u64 {
        if connected {
            self.down_since_ms = None;
            return 0;
        }
        now_ms.saturating_sub(*self.down_since_ms.get_or_insert(now_ms))
    }
}

fn disable_wifi_power_save() {
    match esp_idf_svc::sys::esp!(unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) }) {
        Ok(()) => info!("wifi power save disabled"),
        Err(err) => warn!("failed to disable wifi power save: {err}"),
    }
}

fn station_link_up() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) } == esp_idf_svc::sys::ESP_OK
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

fn clock_now() -> Millis {
    Millis::from_counter(monotonic_ms())
}
