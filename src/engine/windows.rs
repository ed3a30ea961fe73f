use crate::engine::KeySink;
use crate::model::config::{Modifier, WindowId};
use log::{debug, warn};
use std::sync::atomic::{AtomicU32, Ordering};
use windows::Win32::Foundation::{CloseHandle, HWND, LPARAM, WPARAM};
use windows::Win32::System::ProcessStatus::K32GetModuleBaseNameW;
use windows::Win32::System::Threading::{
    OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ,
};
use windows::Win32::UI::Input::KeyboardAndMouse::{
    INPUT, INPUT_0, INPUT_KEYBOARD, KEYBDINPUT, KEYBD_EVENT_FLAGS, KEYEVENTF_EXTENDEDKEY,
    KEYEVENTF_KEYUP, KEYEVENTF_SCANCODE, MAP_VIRTUAL_KEY_TYPE, MapVirtualKeyW, SendInput,
    VK_CONTROL, VK_DELETE, VK_DOWN, VK_INSERT, VK_LWIN, VK_MENU, VK_PRIOR, VK_SHIFT,
};
use windows::Win32::UI::WindowsAndMessaging::{
    EnumWindows, GetWindowTextW, GetWindowThreadProcessId, IsWindowVisible, PostMessageW,
    WM_KEYDOWN, WM_KEYUP,
};

const MAPVK_VK_TO_VSC: MAP_VIRTUAL_KEY_TYPE = MAP_VIRTUAL_KEY_TYPE(0);

/// Scan-code lookups go through the OS once per key; zero means "not yet
/// cached" so stored values are offset by one.
static SCAN_CODES: [AtomicU32; 256] = [const { AtomicU32::new(0) }; 256];

fn scan_code(vk: u32) -> u32 {
    if vk >= 256 {
        return unsafe { MapVirtualKeyW(vk, MAPVK_VK_TO_VSC) };
    }
    let cached = SCAN_CODES[vk as usize].load(Ordering::Relaxed);
    if cached != 0 {
        return cached - 1;
    }
    let mapped = unsafe { MapVirtualKeyW(vk, MAPVK_VK_TO_VSC) };
    SCAN_CODES[vk as usize].store(mapped + 1, Ordering::Relaxed);
    mapped
}

fn is_extended(vk: u32) -> bool {
    (VK_PRIOR.0 as u32..=VK_DOWN.0 as u32).contains(&vk)
        || vk == VK_INSERT.0 as u32
        || vk == VK_DELETE.0 as u32
}

fn hwnd_of(id: WindowId) -> HWND {
    HWND(id.0 as *mut core::ffi::c_void)
}

fn modifier_vk(modifier: Modifier) -> Option<u32> {
    match modifier {
        Modifier::None => None,
        Modifier::Shift => Some(VK_SHIFT.0 as u32),
        Modifier::Ctrl => Some(VK_CONTROL.0 as u32),
    }
}

fn keyboard_input(vk: u32, up: bool) -> INPUT {
    let mut flags = KEYBD_EVENT_FLAGS(0);
    let scan = scan_code(vk);
    if scan > 0 {
        flags |= KEYEVENTF_SCANCODE;
    }
    if is_extended(vk) {
        flags |= KEYEVENTF_EXTENDEDKEY;
    }
    if up {
        flags |= KEYEVENTF_KEYUP;
    }
    INPUT {
        r#type: INPUT_KEYBOARD,
        Anonymous: INPUT_0 {
            ki: KEYBDINPUT {
                wVk: windows::Win32::UI::Input::KeyboardAndMouse::VIRTUAL_KEY(vk as u16),
                wScan: scan as u16,
                dwFlags: flags,
                time: 0,
                dwExtraInfo: 0,
            },
        },
    }
}

fn send_inputs(inputs: &[INPUT]) {
    if inputs.is_empty() {
        return;
    }
    let sent = unsafe { SendInput(inputs, std::mem::size_of::<INPUT>() as i32) };
    if sent != inputs.len() as u32 {
        warn!("SendInput sent {}/{} events", sent, inputs.len());
    }
}

fn post_key(window: HWND, vk: u32, up: bool) {
    let mut lparam: isize = 1; // repeat count
    lparam |= (scan_code(vk) as isize) << 16;
    if is_extended(vk) {
        lparam |= 1 << 24;
    }
    let msg = if up {
        lparam |= 1 << 30; // previous key state
        lparam |= 1isize << 31; // transition state
        WM_KEYUP
    } else {
        WM_KEYDOWN
    };
    if let Err(err) = unsafe {
        PostMessageW(Some(window), msg, WPARAM(vk as usize), LPARAM(lparam))
    } {
        debug!("PostMessage to {:?} failed: {}", window, err);
    }
}

/// Dispatches key events through Win32. Focused-window targets use
/// `SendInput` batches; explicit window handles get posted
/// `WM_KEYDOWN`/`WM_KEYUP` messages so the target does not need focus.
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsKeySink;

impl WindowsKeySink {
    pub fn new() -> Self {
        Self
    }
}

impl KeySink for WindowsKeySink {
    fn press(&self, key_code: u32, modifier: Modifier, window: Option<WindowId>) {
        let modifier_key = modifier_vk(modifier);
        match window {
            Some(id) => {
                let h = hwnd_of(id);
                if let Some(mk) = modifier_key {
                    post_key(h, mk, false);
                }
                post_key(h, key_code, false);
                // Transient modifier: released right after the key goes down.
                if let Some(mk) = modifier_key {
                    post_key(h, mk, true);
                }
            }
            None => {
                let mut inputs: Vec<INPUT> = Vec::with_capacity(3);
                if let Some(mk) = modifier_key {
                    inputs.push(keyboard_input(mk, false));
                }
                inputs.push(keyboard_input(key_code, false));
                if let Some(mk) = modifier_key {
                    inputs.push(keyboard_input(mk, true));
                }
                send_inputs(&inputs);
            }
        }
    }

    fn release(&self, key_code: u32, modifier: Modifier, window: Option<WindowId>) {
        match window {
            Some(id) => post_key(hwnd_of(id), key_code, true),
            None => {
                let mut inputs: Vec<INPUT> = Vec::with_capacity(2);
                inputs.push(keyboard_input(key_code, true));
                if let Some(mk) = modifier_vk(modifier) {
                    inputs.push(keyboard_input(mk, true));
                }
                send_inputs(&inputs);
            }
        }
    }

    fn release_modifiers(&self) {
        let inputs = [
            keyboard_input(VK_SHIFT.0 as u32, true),
            keyboard_input(VK_CONTROL.0 as u32, true),
            keyboard_input(VK_MENU.0 as u32, true),
            keyboard_input(VK_LWIN.0 as u32, true),
        ];
        send_inputs(&inputs);
    }
}

/// One visible top-level window, for channel routing UIs.
#[derive(Debug, Clone)]
pub struct WindowInfo {
    pub window: WindowId,
    pub title: String,
    pub process: String,
    pub pid: u32,
}

unsafe extern "system" fn enum_windows_proc(
    hwnd: HWND,
    lparam: LPARAM,
) -> windows::core::BOOL {
    let windows_out = unsafe { &mut *(lparam.0 as *mut Vec<WindowInfo>) };

    if !unsafe { IsWindowVisible(hwnd) }.as_bool() {
        return true.into();
    }

    let mut title_buf = [0u16; 256];
    let len = unsafe { GetWindowTextW(hwnd, &mut title_buf) };
    if len <= 0 {
        return true.into();
    }
    let title = String::from_utf16_lossy(&title_buf[..len as usize]);
    if title.trim().is_empty() {
        return true.into();
    }

    let mut pid: u32 = 0;
    unsafe { GetWindowThreadProcessId(hwnd, Some(&mut pid)) };

    let mut process = String::from("Unknown");
    if let Ok(handle) =
        unsafe { OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, false, pid) }
    {
        let mut name_buf = [0u16; 260];
        let n = unsafe { K32GetModuleBaseNameW(handle, None, &mut name_buf) };
        if n > 0 {
            process = String::from_utf16_lossy(&name_buf[..n as usize]);
        }
        let _ = unsafe { CloseHandle(handle) };
    }

    windows_out.push(WindowInfo {
        window: WindowId(hwnd.0 as isize),
        title,
        process,
        pid,
    });
    true.into()
}

/// Undoes the 1 ms timer resolution request when the worker exits.
pub(crate) struct WorkerHints;

impl Drop for WorkerHints {
    fn drop(&mut self) {
        unsafe {
            let _ = windows::Win32::Media::timeEndPeriod(1);
        }
    }
}

/// Best-effort real-time hints for the playback worker: 1 ms timer
/// resolution, highest thread priority, and affinity to the last logical
/// processor to keep clear of the target application's busy cores.
/// Failures are logged and ignored.
pub(crate) fn configure_worker_thread() -> WorkerHints {
    use windows::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
    use windows::Win32::System::Threading::{
        GetCurrentThread, SetThreadAffinityMask, SetThreadPriority, THREAD_PRIORITY_HIGHEST,
    };

    unsafe {
        let _ = windows::Win32::Media::timeBeginPeriod(1);

        let thread = GetCurrentThread();
        if SetThreadPriority(thread, THREAD_PRIORITY_HIGHEST).is_ok() {
            debug!("playback worker priority set to HIGHEST");
        } else {
            warn!("failed to raise playback worker priority");
        }

        let mut info = SYSTEM_INFO::default();
        GetSystemInfo(&mut info);
        let processors = info.dwNumberOfProcessors as usize;
        if processors > 0 {
            let cpu = (processors - 1).min(usize::BITS as usize - 1);
            let mask = 1usize << cpu;
            if SetThreadAffinityMask(thread, mask) == 0 {
                warn!("failed to pin playback worker to processor {}", cpu);
            } else {
                debug!("playback worker pinned to logical processor {}", cpu);
            }
        }
    }

    WorkerHints
}

/// Enumerate visible, titled top-level windows.
pub fn list_windows() -> Vec<WindowInfo> {
    let mut out: Vec<WindowInfo> = Vec::new();
    let lparam = LPARAM(&mut out as *mut Vec<WindowInfo> as isize);
    if let Err(err) = unsafe { EnumWindows(Some(enum_windows_proc), lparam) } {
        warn!("EnumWindows failed: {}", err);
    }
    debug!("found {} visible windows", out.len());
    out
}
