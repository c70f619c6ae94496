use crate::art::{self, JniMethods};
use crate::hooks::{self, ENTRY_COUNT, LOCATION_CLASS};
use anyhow::{Context, Result};
use jni::JNIEnv;
use jni::objects::JString;
use jni_sys::jstring;
use log::{debug, error, info, warn};
use mockgps_common::ext::ResultExt;
use mockgps_core::channel::{self, Applied, ControlMessage, ControlSource, Event, Hello, StreamSource};
use mockgps_core::config::{CONFIG_FILE, MAX_CONFIG_SIZE, ModuleConfig};
use mockgps_core::hook::Patch;
use mockgps_core::resolver::{NativeLookup, ProcessLookup, SymbolDescriptor, SymbolResolver};
use mockgps_core::state::{self, ModuleState};
use mockgps_core::target::{Decision, TargetDescriptor, TargetFilter};
use mockgps_core::Error;
use mockgps_zygisk::{Api, AppSpecializeArgs, ServerSpecializeArgs, ZygiskModule, ZygiskOption};
use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::sync::Arc;

/// What pre-specialization learned, carried over to post-specialization.
struct Pending {
    target: TargetDescriptor,
    config: ModuleConfig,
    initial: Option<ControlMessage>,
    source: Option<StreamSource>,
}

pub struct MockGps {
    api: Api,
    env: *mut jni_sys::JNIEnv,
    pending: Option<Pending>,
}

impl ZygiskModule for MockGps {
    fn new(api: Api, env: *mut jni_sys::JNIEnv) -> Self {
        crate::init_logger(crate::MODULE_TAG);

        Self {
            api,
            env,
            pending: None,
        }
    }

    fn pre_app_specialize(&mut self, args: &mut AppSpecializeArgs) {
        match self.prepare(args) {
            Ok(Some(pending)) => self.pending = Some(pending),
            Ok(None) => self.api.set_option(ZygiskOption::DlcloseModuleLibrary),
            Err(err) => {
                warn!("skipping process: {err:?}");
                self.api.set_option(ZygiskOption::DlcloseModuleLibrary);
            }
        }
    }

    fn post_app_specialize(&mut self, _args: &AppSpecializeArgs) {
        let Some(pending) = self.pending.take() else {
            return;
        };

        self.activate(pending).log_with_context("activation failed");
    }

    fn pre_server_specialize(&mut self, _args: &mut ServerSpecializeArgs) {
        self.api.set_option(ZygiskOption::DlcloseModuleLibrary);
    }
}

impl MockGps {
    fn jni(&self) -> Result<JNIEnv<'_>> {
        Ok(unsafe { JNIEnv::from_raw(self.env) }?)
    }

    fn prepare(&self, args: &AppSpecializeArgs) -> Result<Option<Pending>> {
        let mut env = self.jni()?;
        let process_name = read_string(&mut env, args.nice_name()).context("no process name")?;
        let app_data_dir = read_string(&mut env, args.app_data_dir());

        let target = TargetDescriptor::new(&process_name, app_data_dir.as_deref(), args.uid() as u32)
            .child_zygote(args.is_child_zygote());

        let (config, filter) = match self.load_config() {
            Ok(config) => {
                let filter = TargetFilter::from_config(Ok(&config.filter));
                (config, filter)
            }
            Err(err) => (ModuleConfig::default(), TargetFilter::from_config(Err(err))),
        };

        if filter.evaluate(&target) == Decision::Ignore {
            debug!("ignoring {}", target.process_name);
            return Ok(None);
        }

        info!("intercepting {} (uid {})", target.process_name, target.uid);

        let (initial, source) = self.connect(&target, &config).ok_or_warn().unwrap_or_default();

        Ok(Some(Pending {
            target,
            config,
            initial,
            source,
        }))
    }

    fn load_config(&self) -> mockgps_core::Result<ModuleConfig> {
        let dir = self
            .api
            .get_module_dir()
            .ok_or_else(|| Error::configuration("module directory unavailable"))?;

        let fd = fcntl::openat(&dir, CONFIG_FILE, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())
            .map_err(io::Error::from)?;

        let mut content = String::new();
        File::from(fd)
            .take(MAX_CONFIG_SIZE as u64 + 1)
            .read_to_string(&mut content)?;

        if content.len() > MAX_CONFIG_SIZE {
            return Err(Error::configuration(format!("{CONFIG_FILE} exceeds {MAX_CONFIG_SIZE} bytes")));
        }

        ModuleConfig::parse(&content)
    }

    /// Introduces this process to the companion and takes the state it
    /// answers with. The socket is kept for live updates only if zygote
    /// agrees to leave it open.
    fn connect(
        &self,
        target: &TargetDescriptor,
        config: &ModuleConfig,
    ) -> Result<(Option<ControlMessage>, Option<StreamSource>)> {
        let stream = self.api.connect_companion().context("companion unavailable")?;
        let timeout = config.channel.handshake_timeout();

        let hello = Hello::new(target.uid, target.package_name.as_str());
        let mut source = StreamSource::handshake(stream, &hello, timeout)?;

        let initial = match source.recv(timeout)? {
            Event::Message(message) => Some(message),
            Event::Rejected(err) => {
                warn!("initial state rejected: {err}");
                None
            }
            Event::Idle | Event::Closed => None,
        };

        let keep = self.api.exempt_fd(source.as_raw_fd());

        if !keep {
            warn!("companion socket not exempted, live updates disabled");
        }

        Ok((initial, keep.then_some(source)))
    }

    fn activate(&self, pending: Pending) -> Result<()> {
        let Pending {
            target,
            config,
            initial,
            source,
        } = pending;

        let methods = unsafe { JniMethods::new(self.env) };
        let layout = art::probe_layout(&methods);

        let resolver =
            SymbolResolver::new(Box::new(ProcessLookup) as Box<dyn NativeLookup>).with_art_layout(layout);
        let trampoline = art::find_trampoline(&resolver, &methods, layout).context("no JNI trampoline")?;

        let location_hooks = hooks::location_hooks();
        hooks::prepare(&mut self.jni()?, &location_hooks)?;

        let state = Arc::new(ModuleState::new(target, config, resolver, ENTRY_COUNT));

        if let Some(message) = initial {
            if let Ok(Applied::Teardown) = channel::apply(state.store(), message) {
                info!("companion asked for teardown, leaving process untouched");
                return Ok(());
            }
        }

        let state = state::install(state)?;

        let mut installed = 0;
        for hook in location_hooks
            .iter()
            .filter(|hook| (hook.enabled)(&state.config().hooks))
        {
            let descriptor = SymbolDescriptor::managed(LOCATION_CLASS, hook.method, hook.signature);
            let patch = Patch::ArtMethod {
                replacement: hook.replacement,
                trampoline,
            };

            match state.hook(hook.index, &descriptor, patch, Some(&methods)) {
                Ok(_) => installed += 1,
                Err(err) => warn!("{err}"),
            }
        }

        info!("{installed} Location getters hooked in {}", state.target().package_name);

        state::restore_on_exit().log_with_context("exit handler not registered");

        if let Some(source) = source {
            state.start_channel(Box::new(source) as Box<dyn ControlSource>)?;
        }

        Ok(())
    }
}

fn read_string(env: &mut JNIEnv, value: jstring) -> Option<String> {
    if value.is_null() {
        return None;
    }

    let value = unsafe { JString::from_raw(value) };

    match env.get_string(&value).map(String::from) {
        Ok(value) => Some(value),
        Err(err) => {
            error!("failed to read jstring: {err}");
            None
        }
    }
}
