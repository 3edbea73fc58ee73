//! Notifier - Schnittstelle für benutzer-sichtbares Feedback
//!
//! Der Session-Kern rendert nichts selbst. Jede Statusänderung wird genau
//! einmal über `status_changed` gemeldet, Systemtexte laufen über `show`,
//! der Gesprächs-Timer über `duration_tick`. Wie das dargestellt wird,
//! entscheidet der Einbettende.

use crate::call::CallStatus;

/// Empfänger für benutzer-sichtbares Feedback aus dem Call-Kern.
///
/// Wird vom Einbettenden implementiert (z.B. Terminal-Ausgabe, GUI-Events).
/// Alle Methoden müssen schnell zurückkehren und dürfen nicht blockieren.
pub trait Notifier: Send + Sync {
    /// Zeigt eine System-Nachricht an ("Calling user abc...", "Call ended. ...").
    fn show(&self, text: &str);

    /// Wird genau einmal pro Status-Übergang aufgerufen.
    fn status_changed(&self, status: CallStatus, peer_name: Option<&str>);

    /// Tickt einmal pro Sekunde solange der Anruf verbunden ist.
    fn duration_tick(&self, seconds: u64);
}

/// Notifier der alles verwirft. Praktisch für Einbettungen ohne UI.
#[derive(Debug, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn show(&self, _text: &str) {}

    fn status_changed(&self, _status: CallStatus, _peer_name: Option<&str>) {}

    fn duration_tick(&self, _seconds: u64) {}
}
