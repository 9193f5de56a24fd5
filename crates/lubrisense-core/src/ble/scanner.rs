//! BLE Scanner - 发现润滑器外设
//!
//! 过滤条件为「名称包含子串」或「广播了指定服务 UUID」，两者取或，
//! 名称比较忽略大小写。同一扫描会话内每个设备标识只上报一次。
//!
//! 发现结果在 `stop()` 之后仍然保留，供连接时直接查找；下一次
//! `start()` 会清空。`find()` 的命中单独缓存，不进入过滤后的结果集。

use crate::ble::radio::{Advertisement, Radio};
use crate::ble::BleError;
use futures_util::StreamExt;
use log::{debug, info, trace};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    pub name_contains: Option<String>,
    pub service_uuids: Vec<Uuid>,
}

/// 设备因哪个条件被选中
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Name,
    Service,
    /// 过滤器为空，接受所有设备
    Unfiltered,
}

impl ScanFilter {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name_contains: Some(name.into()),
            service_uuids: Vec::new(),
        }
    }

    pub fn with_service(mut self, uuid: Uuid) -> Self {
        self.service_uuids.push(uuid);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.name_contains.as_deref().is_none_or(str::is_empty) && self.service_uuids.is_empty()
    }

    pub fn matches(&self, adv: &Advertisement) -> Option<MatchKind> {
        if self.is_empty() {
            return Some(MatchKind::Unfiltered);
        }

        if let (Some(needle), Some(name)) = (self.name_contains.as_deref(), adv.local_name.as_deref())
            && !needle.is_empty()
            && name.to_lowercase().contains(&needle.to_lowercase())
        {
            return Some(MatchKind::Name);
        }

        if adv.services.iter().any(|s| self.service_uuids.contains(s)) {
            return Some(MatchKind::Service);
        }

        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub identity: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub matched_by: MatchKind,
}

impl DiscoveredDevice {
    fn from_advertisement(adv: Advertisement, matched_by: MatchKind) -> Self {
        Self {
            identity: adv.identity,
            name: adv.local_name,
            rssi: adv.rssi,
            matched_by,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<unknown>")
    }
}

type DiscoveredMap = Arc<Mutex<HashMap<String, DiscoveredDevice>>>;

struct ScanTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct BleScanner {
    radio: Arc<dyn Radio>,
    discovered: DiscoveredMap,
    /// `find()` 定位到的设备
    located: Mutex<HashMap<String, DiscoveredDevice>>,
    task: tokio::sync::Mutex<Option<ScanTask>>,
}

fn key(identity: &str) -> String {
    identity.trim().to_lowercase()
}

impl BleScanner {
    pub fn new(radio: Arc<dyn Radio>) -> Self {
        Self {
            radio,
            discovered: Arc::new(Mutex::new(HashMap::new())),
            located: Mutex::new(HashMap::new()),
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// 开始持续扫描，新设备通过返回的通道实时上报
    ///
    /// 已有的扫描会先被停止。
    pub async fn start(
        &self,
        filter: ScanFilter,
    ) -> Result<mpsc::Receiver<DiscoveredDevice>, BleError> {
        let mut task = self.task.lock().await;
        if let Some(previous) = task.take() {
            debug!("Restarting scan");
            self.finish(previous).await;
        }

        if let Ok(mut map) = self.discovered.lock() {
            map.clear();
        }

        let mut advertisements = self.radio.start_scan().await?;
        info!("Scan started (filter: {:?})", filter);

        let (tx, rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();
        let discovered = self.discovered.clone();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    adv = advertisements.next() => {
                        let Some(adv) = adv else {
                            debug!("Advertisement stream ended");
                            break;
                        };
                        let Some(kind) = filter.matches(&adv) else {
                            trace!("Ignoring {}", adv.identity);
                            continue;
                        };

                        let device = DiscoveredDevice::from_advertisement(adv, kind);
                        let fresh = match discovered.lock() {
                            Ok(mut map) => match map.entry(key(&device.identity)) {
                                std::collections::hash_map::Entry::Occupied(_) => false,
                                std::collections::hash_map::Entry::Vacant(slot) => {
                                    slot.insert(device.clone());
                                    true
                                }
                            },
                            Err(_) => false,
                        };

                        if fresh {
                            debug!(
                                "Device found: id={}, name='{}', match={:?}",
                                device.identity,
                                device.display_name(),
                                device.matched_by
                            );
                            // 接收端已关闭时继续收集结果
                            let _ = tx.send(device).await;
                        }
                    }
                }
            }
        });

        *task = Some(ScanTask { cancel, handle });
        Ok(rx)
    }

    /// 停止扫描；未在扫描时调用也是安全的
    pub async fn stop(&self) {
        let mut task = self.task.lock().await;
        if let Some(running) = task.take() {
            self.finish(running).await;
            info!("Scan stopped");
        }
    }

    async fn finish(&self, running: ScanTask) {
        running.cancel.cancel();
        let _ = running.handle.await;
        if let Err(e) = self.radio.stop_scan().await {
            debug!("stop_scan failed: {}", e);
        }
    }

    pub async fn is_scanning(&self) -> bool {
        self.task.lock().await.is_some()
    }

    /// 当前结果集
    pub fn discovered(&self) -> Vec<DiscoveredDevice> {
        self.discovered
            .lock()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default()
    }

    /// 先查过滤后的结果集，再查定位缓存
    pub fn lookup(&self, identity: &str) -> Option<DiscoveredDevice> {
        let wanted = key(identity);
        self.discovered
            .lock()
            .ok()
            .and_then(|map| map.get(&wanted).cloned())
            .or_else(|| {
                self.located
                    .lock()
                    .ok()
                    .and_then(|map| map.get(&wanted).cloned())
            })
    }

    /// 以设备标识为键的一次性扫描，不受名称过滤影响
    pub async fn find(&self, identity: &str, timeout: Duration) -> Result<DiscoveredDevice, BleError> {
        let mut advertisements = self.radio.start_scan().await?;
        debug!("Looking for {} (timeout {:?})", identity, timeout);

        let wanted = key(identity);
        let found = tokio::time::timeout(timeout, async {
            while let Some(adv) = advertisements.next().await {
                if key(&adv.identity) == wanted {
                    return Some(adv);
                }
            }
            None
        })
        .await;

        drop(advertisements);
        if let Err(e) = self.radio.stop_scan().await {
            debug!("stop_scan failed: {}", e);
        }

        match found {
            Ok(Some(adv)) => {
                let device = DiscoveredDevice::from_advertisement(adv, MatchKind::Unfiltered);
                if let Ok(mut map) = self.located.lock() {
                    map.insert(wanted, device.clone());
                }
                Ok(device)
            }
            Ok(None) | Err(_) => Err(BleError::DeviceNotFound(identity.to_string())),
        }
    }

    /// 扫描固定时长并返回结果
    pub async fn scan(
        &self,
        filter: ScanFilter,
        duration: Duration,
    ) -> Result<Vec<DiscoveredDevice>, BleError> {
        info!("Scanning for {} seconds", duration.as_secs());
        let mut rx = self.start(filter).await?;

        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                device = rx.recv() => if device.is_none() { break },
            }
        }

        self.stop().await;
        let devices = self.discovered();
        info!("Scan complete: found {} device(s)", devices.len());
        Ok(devices)
    }
}
