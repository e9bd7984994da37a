//! crates/study_core/src/language.rs
//!
//! Language detection for prompts and the localized fallback content used
//! when the model under-delivers.

use std::sync::LazyLock;

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    En,
    Es,
    De,
}

static DEADLINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(tomorrow|tonight|mañana|manana|esta noche|morgen|heute abend)\b")
        .expect("deadline pattern is valid")
});

const EN_MARKERS: &[&str] = &["the", "and", "for", "my", "with", "exam", "test", "study", "of", "is"];
const ES_MARKERS: &[&str] = &["el", "la", "los", "las", "de", "para", "mi", "con", "examen", "estudiar", "y", "es"];
const DE_MARKERS: &[&str] = &["der", "die", "das", "und", "für", "mein", "meine", "mit", "prüfung", "lernen", "ist"];

impl Language {
    pub fn code(&self) -> &'static str {
        match self {
            Language::En => "en",
            Language::Es => "es",
            Language::De => "de",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_lowercase().as_str() {
            "en" | "english" => Some(Language::En),
            "es" | "spanish" | "español" => Some(Language::Es),
            "de" | "german" | "deutsch" => Some(Language::De),
            _ => None,
        }
    }

    /// Picks the language whose stop words occur most often. Ties go to English.
    pub fn detect(text: &str) -> Self {
        let lowered = text.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        let score = |markers: &[&str]| words.iter().filter(|w| markers.contains(w)).count();
        let en = score(EN_MARKERS);
        let es = score(ES_MARKERS);
        let de = score(DE_MARKERS);

        if es > en && es >= de {
            Language::Es
        } else if de > en && de > es {
            Language::De
        } else {
            Language::En
        }
    }

    /// Word used in place of the topic when the prompt gives nothing usable.
    pub fn generic_topic(&self) -> &'static str {
        match self {
            Language::En => "your exam",
            Language::Es => "tu examen",
            Language::De => "deine Prüfung",
        }
    }

    pub fn fallback_title(&self, topic: &str) -> String {
        match self {
            Language::En => format!("Study plan: {}", topic),
            Language::Es => format!("Plan de estudio: {}", topic),
            Language::De => format!("Lernplan: {}", topic),
        }
    }

    pub fn fallback_summary(&self, topic: &str) -> String {
        match self {
            Language::En => format!(
                "A structured plan to prepare for {}: review the core ideas, practice actively and check yourself at the end.",
                topic
            ),
            Language::Es => format!(
                "Un plan estructurado para preparar {}: repasa las ideas clave, practica activamente y compruébate al final.",
                topic
            ),
            Language::De => format!(
                "Ein strukturierter Plan zur Vorbereitung auf {}: Kernideen wiederholen, aktiv üben und am Ende selbst prüfen.",
                topic
            ),
        }
    }

    /// `(title, description)` pairs for padding the block list.
    pub fn block_templates(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Language::En => &[
                ("Overview of the material", "Skim all sources and list the main topics you need to cover."),
                ("Core concepts", "Work through the central definitions and ideas until you can explain them in your own words."),
                ("Worked examples", "Solve the typical example problems step by step."),
                ("Practice problems", "Do exercises without looking at the solutions, then compare."),
                ("Weak spots", "Revisit the topics you got wrong and rewrite your notes for them."),
                ("Final review", "Go over your summary notes and the practice questions one last time."),
            ],
            Language::Es => &[
                ("Visión general del material", "Revisa todas las fuentes y anota los temas principales."),
                ("Conceptos clave", "Estudia las definiciones e ideas centrales hasta poder explicarlas con tus palabras."),
                ("Ejemplos resueltos", "Resuelve los problemas típicos paso a paso."),
                ("Ejercicios de práctica", "Haz ejercicios sin mirar las soluciones y luego compara."),
                ("Puntos débiles", "Repasa los temas en los que fallaste y reescribe tus apuntes."),
                ("Repaso final", "Revisa tu resumen y las preguntas de práctica una última vez."),
            ],
            Language::De => &[
                ("Überblick über den Stoff", "Alle Quellen überfliegen und die Hauptthemen notieren."),
                ("Kernkonzepte", "Zentrale Definitionen und Ideen durcharbeiten, bis du sie in eigenen Worten erklären kannst."),
                ("Beispielaufgaben", "Typische Beispielaufgaben Schritt für Schritt lösen."),
                ("Übungsaufgaben", "Aufgaben ohne Lösung bearbeiten und danach vergleichen."),
                ("Schwachstellen", "Fehlerhafte Themen wiederholen und die Notizen dazu neu schreiben."),
                ("Abschlusswiederholung", "Zusammenfassung und Übungsfragen ein letztes Mal durchgehen."),
            ],
        }
    }

    /// `(heading, bullet)` pairs for padding the notes section.
    pub fn note_templates(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Language::En => &[
                ("Key concepts", "Write down the central ideas of each topic in one sentence."),
                ("Definitions", "Collect the exact definitions your course uses."),
                ("Formulas and rules", "List every formula or rule with the conditions it needs."),
                ("Common mistakes", "Note the errors that come up most often and how to avoid them."),
                ("Exam tips", "Read every question twice and start with the ones you are sure about."),
            ],
            Language::Es => &[
                ("Conceptos clave", "Escribe la idea central de cada tema en una frase."),
                ("Definiciones", "Reúne las definiciones exactas que usa tu curso."),
                ("Fórmulas y reglas", "Anota cada fórmula o regla con las condiciones que necesita."),
                ("Errores comunes", "Apunta los errores más frecuentes y cómo evitarlos."),
                ("Consejos para el examen", "Lee cada pregunta dos veces y empieza por las que dominas."),
            ],
            Language::De => &[
                ("Kernkonzepte", "Die zentrale Idee jedes Themas in einem Satz festhalten."),
                ("Definitionen", "Die genauen Definitionen aus deinem Kurs sammeln."),
                ("Formeln und Regeln", "Jede Formel oder Regel mit ihren Voraussetzungen notieren."),
                ("Häufige Fehler", "Die häufigsten Fehler und wie man sie vermeidet aufschreiben."),
                ("Prüfungstipps", "Jede Frage zweimal lesen und mit den sicheren Aufgaben beginnen."),
            ],
        }
    }

    /// `(question, answer)` pairs for padding practice questions. `{topic}` is substituted.
    pub fn practice_templates(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Language::En => &[
                ("What are the most important ideas in {topic}?", "List the core concepts from your notes and explain each one briefly."),
                ("Explain one key definition from {topic} in your own words.", "Compare your explanation with the definition in your material."),
                ("Which formula or rule from {topic} do you use most, and when does it apply?", "State the rule and the conditions under which it holds."),
                ("Solve a typical exercise on {topic} without notes.", "Check each step against a worked example."),
                ("What mistake do students often make in {topic}?", "Name the mistake and describe how to avoid it."),
            ],
            Language::Es => &[
                ("¿Cuáles son las ideas más importantes de {topic}?", "Enumera los conceptos clave de tus apuntes y explica cada uno."),
                ("Explica con tus palabras una definición clave de {topic}.", "Compara tu explicación con la definición de tu material."),
                ("¿Qué fórmula o regla de {topic} usas más y cuándo se aplica?", "Enuncia la regla y las condiciones en las que se cumple."),
                ("Resuelve un ejercicio típico de {topic} sin apuntes.", "Comprueba cada paso con un ejemplo resuelto."),
                ("¿Qué error cometen a menudo los estudiantes en {topic}?", "Nombra el error y describe cómo evitarlo."),
            ],
            Language::De => &[
                ("Was sind die wichtigsten Ideen in {topic}?", "Die Kernkonzepte aus den Notizen aufzählen und kurz erklären."),
                ("Erkläre eine zentrale Definition aus {topic} in eigenen Worten.", "Die eigene Erklärung mit der Definition im Material vergleichen."),
                ("Welche Formel oder Regel aus {topic} nutzt du am häufigsten und wann gilt sie?", "Die Regel und ihre Voraussetzungen nennen."),
                ("Löse eine typische Aufgabe zu {topic} ohne Notizen.", "Jeden Schritt mit einer Beispiellösung abgleichen."),
                ("Welcher Fehler passiert in {topic} besonders oft?", "Den Fehler benennen und beschreiben, wie man ihn vermeidet."),
            ],
        }
    }

    /// Suffix used to keep padded titles distinct, e.g. "Practice problems (2)".
    pub fn repeat_suffix(&self, round: usize) -> String {
        format!(" ({})", round + 1)
    }

    /// Instruction appended to prompts so the model answers in this language.
    pub fn instruction(&self) -> &'static str {
        match self {
            Language::En => "Write every text field in English.",
            Language::Es => "Escribe todos los campos de texto en español.",
            Language::De => "Schreibe alle Textfelder auf Deutsch.",
        }
    }
}

/// True when the prompt mentions an imminent deadline ("tomorrow", "mañana", "morgen", ...).
pub fn mentions_imminent_deadline(prompt: &str) -> bool {
    DEADLINE_RE.is_match(prompt)
}

/// Short topic phrase taken from the prompt's first non-empty line.
pub fn topic_from_prompt(prompt: &str, language: Language) -> String {
    let first_line = prompt
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    let topic: String = first_line.chars().take(60).collect();
    let topic = topic.trim();
    if topic.is_empty() {
        language.generic_topic().to_string()
    } else {
        topic.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_languages() {
        assert_eq!(Language::detect("Help me study for the biology exam"), Language::En);
        assert_eq!(
            Language::detect("Necesito estudiar para el examen de historia y la química"),
            Language::Es
        );
        assert_eq!(
            Language::detect("Ich muss für die Prüfung in Mathe lernen und das ist schwer"),
            Language::De
        );
        assert_eq!(Language::detect(""), Language::En);
    }

    #[test]
    fn deadline_tokens_match_whole_words() {
        assert!(mentions_imminent_deadline("My exam is TOMORROW morning"));
        assert!(mentions_imminent_deadline("examen mañana"));
        assert!(mentions_imminent_deadline("Klausur morgen früh"));
        assert!(!mentions_imminent_deadline("Exam in two weeks"));
        assert!(!mentions_imminent_deadline("Morgenstern poems"));
    }

    #[test]
    fn every_language_has_enough_templates() {
        for lang in [Language::En, Language::Es, Language::De] {
            assert!(lang.block_templates().len() >= crate::document::MIN_BLOCKS);
            assert!(lang.note_templates().len() >= crate::document::MIN_NOTE_SECTIONS);
            assert!(lang.practice_templates().len() >= crate::document::MIN_PRACTICE_QUESTIONS);
        }
    }

    #[test]
    fn topic_falls_back_to_generic_phrase() {
        assert_eq!(topic_from_prompt("\n  \n", Language::Es), "tu examen");
        assert_eq!(topic_from_prompt("  Linear algebra\nchapter 3", Language::En), "Linear algebra");
    }
}
